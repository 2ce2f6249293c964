#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod backoff;
pub mod clock;
pub mod error;
pub mod push;
pub mod transport;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

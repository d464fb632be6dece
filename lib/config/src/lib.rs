#![no_std]

pub mod cache;
pub mod device;

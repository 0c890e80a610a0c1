pub mod frame;

pub use frame::{decode, encode, Column, Frame};

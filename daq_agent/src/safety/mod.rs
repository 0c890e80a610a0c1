pub mod manipulator;

pub use manipulator::{Bound, SafeManipulator};

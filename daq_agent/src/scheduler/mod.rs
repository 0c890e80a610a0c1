pub mod daq;

pub use daq::DaqScheduler;

pub mod contract;
pub mod optimization;
pub mod scenario;

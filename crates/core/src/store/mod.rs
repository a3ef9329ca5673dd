pub mod scenarios;
pub mod selection;

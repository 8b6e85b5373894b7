pub mod config;
pub mod crd;
pub mod error;
pub mod fsext;
pub mod operator;
pub mod svnconfig;
pub mod updater;

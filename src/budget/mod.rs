pub mod accountant;
pub mod audit;
pub mod backup;
pub mod config;
pub mod continuity;
pub mod ledger;
pub mod observer;
pub mod paths;
pub mod poller;
pub mod progress;
pub mod recovery;
pub mod store;
pub mod summarizer;
pub mod thresholds;
pub mod transcript;
pub mod util;
pub mod warn;
pub mod worker;

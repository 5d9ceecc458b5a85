pub mod batch;
pub mod calibrate;
pub mod config;
pub mod export;
pub mod layout;
pub mod omr;
pub mod pipeline;
pub mod plot;
pub mod resolve;

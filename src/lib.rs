pub mod agent;
pub mod choice;
pub mod config;
pub mod evolution;
pub mod experiment;
pub mod game;
pub mod history;
pub mod logging;
pub mod noise;
pub mod orchestrator;
pub mod pairing;
pub mod session;
pub mod simulation;
pub mod stats;
pub mod storage;

pub mod agent;
pub mod run;

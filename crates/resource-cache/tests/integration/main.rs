mod config;
mod explorer;

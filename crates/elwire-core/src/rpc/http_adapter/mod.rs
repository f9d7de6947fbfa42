mod client;
mod connection;

pub use client::HttpPoller;

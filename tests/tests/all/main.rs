mod channel;
mod resolution;
mod service_config;

pub mod fast;
pub mod speedtest;

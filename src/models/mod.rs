//! Reference model plugins.

pub mod host_kpis;

//! netscenario provisions throwaway tenant topologies on an OpenStack-style
//! cloud, reaches the guests through chained ssh hops and checks how traffic
//! flows: load balancer distribution, persistence and failover, tenant
//! connectivity and outbound DNAT.

pub mod cli;
pub mod cloud;
pub mod config;
pub mod lb;
pub mod oracle;
pub mod probe;
pub mod scenario;
pub mod settings;
pub mod simulate;
pub mod topology;
pub mod tunnel;

pub mod cmd;
pub mod docker;
pub mod iproute;
pub mod ovs;

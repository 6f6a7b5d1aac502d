pub mod credential_store;
pub mod network;
pub mod peripheral;
pub mod provisioning;
pub mod status;

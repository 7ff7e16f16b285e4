mod mock;
mod orchestrator;
mod restore;
mod rpc;

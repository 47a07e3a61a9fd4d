mod autonomous_flow;
mod collaborative_flow;
mod continuous_flow;
mod shutdown_flow;

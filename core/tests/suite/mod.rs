mod dispatch_flow;
mod join_flow;
mod multi_dispatcher;
mod scheduler_flow;

mod end_to_end;
mod helpers;
mod live_broker;
mod publishers;
mod supervisors;
mod topology;

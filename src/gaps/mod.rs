pub mod gap_list;
pub mod gap_store;
pub mod gap_tracker;

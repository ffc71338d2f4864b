mod mutex_cell;

pub use mutex_cell::MutexCell;

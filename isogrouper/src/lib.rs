mod args;
mod driver;
mod io;
mod rt_range;

pub use args::*;
pub use driver::{IsoGrouper, IsoGrouperError};
pub use io::{
    read_database, read_database_path, read_dataset, read_dataset_path, write_database,
    UntargetedReport,
};
pub use rt_range::{RtRange, RtRangeParseError};

use crate::config::parse::load_config;
use crate::time::{format_instant, parse_instant, PartitionSchema, TimePartitioner};
use std::path::PathBuf;

/// Prints `dir start end` of the partition holding `instant`.
///
/// The schema comes from `--schema`, else from the config file when one
/// was found, else `YYYY/DOY`.
pub fn show(
    config_path: Option<PathBuf>,
    instant: &str,
    schema: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema: PartitionSchema = match (schema, config_path) {
        (Some(name), _) => name.parse()?,
        (None, Some(path)) => load_config(&path)?.archive.partitioning.parse()?,
        (None, None) => PartitionSchema::default(),
    };

    let t = parse_instant(instant)?;
    let info = TimePartitioner::new(schema).partition_info(t)?;
    println!(
        "{} {} {}",
        info.dir,
        format_instant(info.start),
        format_instant(info.end)
    );
    Ok(())
}

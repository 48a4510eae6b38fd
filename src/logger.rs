//! Logging init (spec §10.1): `log` facade + `env_logger`, matching the
//! teacher's `logger.rs`/`utils.rs::init_logger`. spec.md §7 names four
//! severities (error/warning/notice/debug); `notice` has no `log` crate
//! level, so it is reported at `info` (see DESIGN.md).

use log::LevelFilter;

pub fn init(level: LevelFilter) {
    env_logger::Builder::new().format_timestamp_millis().filter(None, level).init();
}

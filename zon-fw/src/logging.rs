use aya::Ebpf;
use aya_log::EbpfLogger;
use env_logger::Env;
use log::LevelFilter;

/// Initializes the user app logging from `RUST_LOG`, `level` overrides it.
pub fn init(level: Option<LevelFilter>) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder.format_timestamp_millis().init();
}

/// Enables the program logging by attaching the default logger to the
/// log map loaded along the ebpf program.
pub fn attach_ebpf_logger(ebpf: &mut Ebpf, name: &str) {
    if let Err(e) = EbpfLogger::init(ebpf) {
        // This can happen if all log statements are removed from eBPF program.
        log::warn!("Failed to initialize eBPF logger for {}: {}", name, e);
    }
}

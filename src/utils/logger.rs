use chrono::Utc;
use log::info;
use std::io::Write;

/// Inizializza il logger con il formato del progetto.
///
/// `RUST_LOG` wins over `level` when both are set.
pub fn init(level: &str) {
    let result = env_logger::Builder::new()
        .parse_filters(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] [{}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        info!("Ruggine chat logger initialized");
    }
}

/// Installs the process-wide logger. The filter is read from `filter_env`, falling back to
/// `default_level`. Installing twice is harmless; the second call keeps the first logger.
pub fn init_env_log(filter_env: &str, default_level: &str) {
    use chrono::Utc;
    use std::io::Write;

    let env = env_logger::Env::new().filter_or(filter_env, default_level);
    let installed = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{} {} {} {}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                level_style.value(record.level()),
                thread.name().unwrap_or("<unnamed>"),
                record.file().unwrap_or("<unnamed>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .try_init();

    if installed.is_ok() {
        log::info!("env_logger initialized");
    }
}

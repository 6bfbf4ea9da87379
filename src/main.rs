use anyhow::Context;
use hestia::bms::BmsSource;
use hestia::bms::us2000::Us2000Bms;
use hestia::config::Config;
use hestia::driver::Driver;
use hestia::inverter::InertInverter;
use hestia::logging::{get_logger, init_logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::load().context("loading configuration")?,
    };
    config.validate().context("invalid configuration")?;
    init_logging(&config.logging).context("initializing logging")?;

    let logger = get_logger("main");
    logger.info(&format!("hestia {} starting", env!("APP_VERSION")));

    let bms: Box<dyn BmsSource> = Box::new(Us2000Bms::spawn(config.bms.clone())?);
    let inverter = Box::new(InertInverter::new());

    let (mut driver, handle) = Driver::new(config.clone(), bms, inverter)?;

    let web_config = config.web.clone();
    tokio::spawn(async move {
        if let Err(e) = hestia::web::serve(web_config, handle).await {
            get_logger("web").error(&format!("web server failed: {}", e));
        }
    });

    driver.run().await?;
    Ok(())
}

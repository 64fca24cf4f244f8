use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::Config;

use agent::appender::{Fanout, LogAppender};
use agent::scrape::manager::Manager;
use agent::scrape::scrape::Arguments;
use agent::scrape::Group;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    log4rs::init_config(config)?;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("{panic_info}");
    }));

    let scrape_config = Arguments {
        job_name: "self".to_string(),
        scrape_interval: Duration::from_secs(15),
        scrape_timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let children: Vec<Arc<dyn agent::appender::Appender>> = vec![Arc::new(LogAppender)];
    let sink = Arc::new(Fanout::new(children)?);
    let mut manager = Manager::new(sink);
    manager.apply_config(vec![scrape_config.clone()]).await?;

    let (targets_tx, targets_rx) = tokio::sync::mpsc::channel(1);
    let group = Group {
        targets: vec![HashMap::from([(
            "__address__".to_string(),
            "127.0.0.1:9090".to_string(),
        )])],
        labels: HashMap::new(),
        source: "static".to_string(),
    };
    targets_tx
        .send(HashMap::from([(scrape_config.job_name, vec![group])]))
        .await?;

    info!("agent started");
    tokio::select! {
        _ = manager.run(targets_rx) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    manager.stop().await;
    info!("agent stopped");
    Ok(())
}

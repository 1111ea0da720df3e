use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use price_pipeline::broker::MemoryBroker;
use price_pipeline::consumer::RunningConsumer;
use price_pipeline::kafka::{KafkaConsumer, KafkaProducer, TopicManager};
use price_pipeline::{Config, ConsumerGroupClient, Delivery, PriceUpdate, ProducerClient, RecordHandler};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "price-pipeline")]
#[command(about = "Publish product price updates and consume them per consumer group", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish one price update
    Publish(PublishArgs),
    /// Run the configured consumer groups until Ctrl+C
    Consume {
        /// Only run these groups (default: all configured groups)
        #[arg(short, long = "group")]
        groups: Vec<String>,
    },
    /// Create the configured topics
    CreateTopics,
    /// Run producer and consumers against an in-process broker
    Demo(PublishArgs),
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    #[arg(long)]
    product: String,

    #[arg(long)]
    price: Decimal,

    #[arg(long, default_value = "product-price")]
    topic: String,

    #[arg(long)]
    partition: Option<i32>,
}

impl PublishArgs {
    fn event(&self) -> anyhow::Result<PriceUpdate> {
        if self.product.trim().is_empty() {
            bail!("product must not be empty");
        }
        if self.price <= Decimal::ZERO {
            bail!("price must be positive, got {}", self.price);
        }
        Ok(PriceUpdate::new(self.product.trim(), self.price))
    }
}

/// Stand-in for a downstream system updating its own copy of the price.
struct InventoryHandler {
    group_id: String,
}

#[async_trait]
impl RecordHandler for InventoryHandler {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        info!(
            group_id = %self.group_id,
            topic = %delivery.topic,
            partition = delivery.partition,
            offset = delivery.offset,
            batch = delivery.batch,
            product = delivery.event.product_name(),
            price = %delivery.event.updated_price(),
            "Price update received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting price-pipeline");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        client_id = %config.producer.client_id,
        brokers = ?config.producer.bootstrap_servers,
        acks = ?config.producer.acks,
        max_retries = config.producer.max_retries,
        groups = ?config.consumers.iter().map(|c| c.group_id.as_str()).collect::<Vec<_>>(),
        "Configuration summary"
    );

    match args.command {
        Command::Publish(publish) => run_publish(&config, &publish).await,
        Command::Consume { groups } => run_consume(&config, &groups).await,
        Command::CreateTopics => run_create_topics(&config).await,
        Command::Demo(publish) => run_demo(&config, &publish).await,
    }
}

async fn run_publish(config: &Config, publish: &PublishArgs) -> anyhow::Result<()> {
    let event = publish.event()?;
    let transport = KafkaProducer::new(&config.producer)?;
    let producer = ProducerClient::new(config.producer.clone(), transport)?;

    let outcome = producer
        .send_event(&publish.topic, &event, publish.partition)
        .await;
    producer.close().await;

    let result = outcome.with_context(|| format!("failed to publish {}", event))?;
    info!(
        topic = %result.topic,
        partition = result.partition,
        offset = ?result.offset,
        attempts = result.attempts,
        "Published {}",
        event
    );
    Ok(())
}

async fn run_consume(config: &Config, groups: &[String]) -> anyhow::Result<()> {
    let selected: Vec<_> = config
        .consumers
        .iter()
        .filter(|c| groups.is_empty() || groups.contains(&c.group_id))
        .collect();
    if selected.is_empty() {
        bail!("no consumer groups selected");
    }

    let mut running = Vec::new();
    for group in selected {
        let transport = KafkaConsumer::new(group)?;
        let mut client = ConsumerGroupClient::new(group.clone(), transport)?;
        client
            .subscribe(
                group.topics.iter().cloned(),
                InventoryHandler {
                    group_id: group.group_id.clone(),
                },
            )
            .await
            .with_context(|| format!("group '{}' failed to subscribe", group.group_id))?;
        running.push((group.group_id.clone(), client.spawn()));
    }

    info!(groups = running.len(), "Consumers running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    close_all(running).await;
    Ok(())
}

async fn run_create_topics(config: &Config) -> anyhow::Result<()> {
    let mut manager = TopicManager::new(&config.producer.bootstrap_servers)?;
    for topic in &config.topics {
        manager.ensure_topic_exists(topic).await?;
    }
    Ok(())
}

async fn run_demo(config: &Config, publish: &PublishArgs) -> anyhow::Result<()> {
    let event = publish.event()?;
    let broker = MemoryBroker::new();
    for topic in &config.topics {
        broker.create_topic(&topic.name, topic.partitions);
    }

    let mut running = Vec::new();
    for group in &config.consumers {
        let mut client = ConsumerGroupClient::new(group.clone(), broker.consumer(group.auto_offset_reset)?)?;
        client
            .subscribe(
                group.topics.iter().cloned(),
                InventoryHandler {
                    group_id: group.group_id.clone(),
                },
            )
            .await?;
        running.push((group.group_id.clone(), client.spawn()));
    }

    let producer = ProducerClient::new(config.producer.clone(), broker.producer()?)?;
    let outcome = producer
        .send_event(&publish.topic, &event, publish.partition)
        .await;
    producer.close().await;
    let result = outcome?;
    info!(partition = result.partition, offset = ?result.offset, "Published {}", event);

    let longest_interval = config
        .consumers
        .iter()
        .map(|c| c.poll_interval())
        .max()
        .unwrap_or_default();
    tokio::time::sleep(longest_interval + Duration::from_millis(500)).await;

    close_all(running).await;
    Ok(())
}

async fn close_all(running: Vec<(String, RunningConsumer)>) {
    for (group_id, mut consumer) in running {
        if let Err(e) = consumer.close().await {
            error!(group_id = %group_id, "Consumer stopped with error: {}", e);
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("price_pipeline=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("price_pipeline=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

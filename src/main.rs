use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use observation_cache::api::{ApiServer, ApiServerConfig};
use observation_cache::{CacheConfig, CacheContext, InvalidationScope};

#[derive(Parser)]
#[command(name = "observation-cache")]
#[command(about = "Cache administration for the observation explorer", long_about = None)]
struct Cli {
    /// Redis connection URL (omit to run without a store)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Root namespace for cache keys
    #[arg(long, env = "CACHE_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the cache administration API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Poll change detection endpoints while serving
        #[arg(long)]
        watch: bool,
    },

    /// Show cache and invalidation statistics
    Stats {
        /// Restrict SWR statistics to a key prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// List registered invalidation rules
    Rules,

    /// Invalidate cache entries
    Invalidate {
        /// Rule name, tag, or key pattern
        target: String,

        /// How to interpret the target
        #[arg(short, long, value_enum, default_value = "rule")]
        scope: Scope,

        /// Reason recorded in the audit log
        #[arg(short, long, default_value = "manual")]
        reason: String,
    },

    /// Poll change detection endpoints once
    Check {
        /// Endpoints relative to the change detection base URL
        #[arg(default_value = "/api/observations/check-new")]
        endpoints: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    Tag,
    Pattern,
    Rule,
}

impl From<Scope> for InvalidationScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Tag => InvalidationScope::Tag,
            Scope::Pattern => InvalidationScope::Pattern,
            Scope::Rule => InvalidationScope::Rule,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = CacheConfig::from_env()?;
    if cli.redis_url.is_some() {
        config.redis_url = cli.redis_url.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }

    let context = Arc::new(CacheContext::open(config)?);

    match cli.command {
        Commands::Serve { host, port, watch } => {
            if watch {
                context.start_change_detection();
            }

            let server = ApiServer::new(ApiServerConfig { host, port }, Arc::clone(&context));
            server.start().await?;
        }

        Commands::Stats { ref prefix } => {
            let swr = context.swr().get_stats(prefix.as_deref()).await;
            let invalidation = context.invalidation().get_stats();

            println!("Store: {}", context.store().backend());
            println!(
                "SWR entries: {} total, {} fresh, {} stale, {} expired",
                swr.total_entries, swr.fresh_entries, swr.stale_entries, swr.expired_entries
            );
            println!("Invalidation rules: {}", invalidation.rules_count);
        }

        Commands::Rules => {
            for rule in context.invalidation().rules() {
                println!("{}", rule.name);
                if let Some(pattern) = &rule.pattern {
                    println!("  pattern: {}", pattern);
                }
                if !rule.tags.is_empty() {
                    println!("  tags:    {}", rule.tags.join(", "));
                }
                if !rule.cascade.is_empty() {
                    println!("  cascade: {}", rule.cascade.join(", "));
                }
                if rule.conditional {
                    println!("  conditional");
                }
            }
        }

        Commands::Invalidate {
            ref target,
            scope,
            ref reason,
        } => {
            let removed = context
                .invalidation()
                .manual_invalidate(target, reason, scope.into())
                .await;
            println!("Invalidated {} entries", removed);
        }

        Commands::Check { ref endpoints } => {
            let removed = context.invalidation().check_for_changes(endpoints).await;
            println!("Invalidated {} entries", removed);
        }
    }

    context.close().await;
    Ok(())
}

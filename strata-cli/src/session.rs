use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use colored::Colorize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_cache::{CacheBackend, CacheError, CacheRegistry, MemoryBackend, TieredCache};

/// Backend the session talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Sqlite,
    File,
    Redis,
}

/// One open backend (optionally fronted by an in-process tier) plus the
/// command dispatch on top of it
pub struct Session {
    backend: Arc<dyn CacheBackend<String>>,
    memory: Option<MemoryBackend<String>>,
    tiered: Option<TieredCache<String>>,
    promote_ttl: Duration,
    label: String,
}

impl Session {
    pub async fn open(
        registry: &CacheRegistry,
        kind: BackendKind,
        name: &str,
        tiered: bool,
        promote_ttl: Duration,
    ) -> Result<Self> {
        let mut memory = None;
        let backend: Arc<dyn CacheBackend<String>> = match kind {
            BackendKind::Memory => {
                let backend = registry.memory::<String>();
                memory = Some(backend.clone());
                Arc::new(backend)
            }
            BackendKind::Sqlite => Arc::new(
                registry
                    .sqlite::<String>(name)
                    .await
                    .with_context(|| format!("opening sqlite store '{}'", name))?,
            ),
            BackendKind::File => Arc::new(
                registry
                    .file::<String>(name)
                    .await
                    .with_context(|| format!("opening file store '{}'", name))?,
            ),
            BackendKind::Redis => {
                let remote = registry.remote().ok_or_else(|| {
                    anyhow!("redis backend needs remote.address or STRATA_REDIS_ADDR")
                })?;
                if !remote.is_initialized() {
                    bail!("redis backend at {} is unavailable", remote.url());
                }
                Arc::new(remote)
            }
        };

        let tiered = if tiered {
            if kind == BackendKind::Memory {
                bail!("--tiered needs a sqlite, file or redis backend behind the memory tier");
            }
            let front = registry.memory::<String>();
            memory = Some(front.clone());
            Some(
                TieredCache::builder()
                    .tier(front)
                    .shared_tier(Arc::clone(&backend))
                    .build(),
            )
        } else {
            None
        };

        let label = match (&tiered, kind) {
            (Some(_), _) => format!("memory+{}:{}", backend.backend_name(), name),
            (None, BackendKind::Memory | BackendKind::Redis) => backend.backend_name().to_string(),
            (None, _) => format!("{}:{}", backend.backend_name(), name),
        };

        Ok(Self {
            backend,
            memory,
            tiered,
            promote_ttl,
            label,
        })
    }

    /// Short description for the prompt
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn execute_command(&self, command: &str, args: &[String]) -> Result<String> {
        let start = Instant::now();

        let response = match command.to_uppercase().as_str() {
            "SET" => self.cmd_set(args).await?,
            "GET" => self.cmd_get(args).await?,
            "DEL" | "DELETE" => self.cmd_del(args).await?,
            "EXISTS" => self.cmd_exists(args).await?,
            "INCR" => self.cmd_incr(args).await?,
            "EXPIRE" => self.cmd_expire(args).await?,
            "RPUSH" => self.cmd_rpush(args).await?,
            "BRPOP" => self.cmd_brpop(args).await?,
            "INFO" | "STATS" => self.cmd_stats()?,
            "HELP" => help_text(),
            _ => return Err(anyhow!("Unknown command: {}", command)),
        };

        let elapsed = start.elapsed();
        Ok(format!(
            "{}\n{}",
            response,
            format!("({:.2?})", elapsed).dimmed()
        ))
    }

    async fn cmd_set(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            bail!("Usage: SET key value [ttl]");
        }
        let ttl = match args.get(2) {
            Some(secs) => parse_secs(secs)?,
            None => Duration::ZERO,
        };

        match &self.tiered {
            Some(tiered) => tiered.set(&args[0], args[1].clone(), ttl).await?,
            None => self.backend.set(&args[0], args[1].clone(), ttl).await?,
        }
        Ok("OK".green().to_string())
    }

    async fn cmd_get(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            bail!("Usage: GET key");
        }

        let result = match &self.tiered {
            Some(tiered) => tiered.get(&args[0], self.promote_ttl).await,
            None => self.backend.get(&args[0]).await,
        };
        match result {
            Ok(value) => Ok(format!("\"{}\"", value)),
            Err(e) if e.is_miss() => Ok(nil()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cmd_del(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            bail!("Usage: DEL key [key ...]");
        }

        let mut deleted = 0;
        for key in args {
            if self.backend.exists(key).await? {
                deleted += 1;
            }
            match &self.tiered {
                Some(tiered) => tiered.delete(key).await?,
                None => self.backend.del(key).await?,
            }
        }
        Ok(format!("(integer) {}", deleted))
    }

    async fn cmd_exists(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            bail!("Usage: EXISTS key");
        }
        let exists = self.backend.exists(&args[0]).await?;
        Ok(format!("(integer) {}", u8::from(exists)))
    }

    async fn cmd_incr(&self, args: &[String]) -> Result<String> {
        if args.is_empty() {
            bail!("Usage: INCR key");
        }
        let value = self.backend.incr(&args[0]).await?;
        self.drop_front_copy(&args[0]).await?;
        Ok(format!("(integer) {}", value))
    }

    async fn cmd_expire(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            bail!("Usage: EXPIRE key seconds");
        }
        let ttl = parse_secs(&args[1])?;
        let reply = match self.backend.expire(&args[0], ttl).await {
            Ok(()) => "(integer) 1".to_string(),
            Err(CacheError::Miss(_)) => "(integer) 0".to_string(),
            Err(e) => return Err(e.into()),
        };
        self.drop_front_copy(&args[0]).await?;
        Ok(reply)
    }

    /// Drop the in-process copy of a key changed behind the tiered cache, so
    /// the next GET reads the backing store again
    async fn drop_front_copy(&self, key: &str) -> Result<()> {
        if let Some(front) = self.tiered.as_ref().and_then(|t| t.tier(0)) {
            front.del(key).await?;
        }
        Ok(())
    }

    async fn cmd_rpush(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            bail!("Usage: RPUSH key value [value ...]");
        }
        for value in &args[1..] {
            self.backend.rpush(&args[0], value.clone()).await?;
        }
        Ok(format!("(integer) {}", args.len() - 1))
    }

    async fn cmd_brpop(&self, args: &[String]) -> Result<String> {
        if args.len() < 2 {
            bail!("Usage: BRPOP key timeout");
        }
        let timeout = parse_secs(&args[1])?;
        match self.backend.brpop(timeout, &args[0]).await {
            Ok(value) => Ok(format!("1) \"{}\"\n2) \"{}\"", args[0], value)),
            Err(e) if e.is_miss() => Ok(nil()),
            Err(e) => Err(e.into()),
        }
    }

    fn cmd_stats(&self) -> Result<String> {
        let mut stats = json!({ "backend": self.label });
        if let Some(memory) = &self.memory {
            let memory_stats = memory.stats();
            stats["memory"] = serde_json::to_value(&memory_stats)?;
            stats["memory"]["hit_rate"] = json!(memory_stats.hit_rate());
            stats["memory"]["keys"] = json!(memory.entry_count());
        }
        if let Some(tiered) = &self.tiered {
            stats["tiered"] = serde_json::to_value(tiered.stats())?;
        }
        Ok(serde_json::to_string_pretty(&stats)?)
    }
}

/// Seconds as an integer or a fraction (`1.5`); `0` means no limit
fn parse_secs(raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| anyhow!("invalid number of seconds: {}", raw))?;
    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid number of seconds: {}", raw))
}

fn nil() -> String {
    "(nil)".dimmed().to_string()
}

fn help_text() -> String {
    format!(
        r#"{}

{}
  SET key value [ttl]        Set key with optional TTL in seconds (0 = never expires)
  GET key                    Get the value of key
  DEL key [key ...]          Delete one or more keys
  EXISTS key                 Check if key exists
  INCR key                   Increment the counter at key
  EXPIRE key seconds         Set timeout on key (0 = never expires)

{}
  RPUSH key value [...]      Append values to the queue at key
  BRPOP key timeout          Pop the oldest value, waiting up to timeout seconds (0 = forever)

{}
  STATS                      Show backend statistics
  HELP                       Show this help message
  QUIT                       Exit the CLI
"#,
        "Strata CLI - Available Commands".bold().cyan(),
        "Key Commands:".bold(),
        "Queue Commands:".bold(),
        "Session Commands:".bold(),
    )
}

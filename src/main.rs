// EsoxSolutions.SessionPool
// Demo binary: drives a pool of simulated sessions from many tasks.
// Set RUST_LOG=esox_sessionpool=debug to watch the pool work.

use async_trait::async_trait;
use esox_sessionpool::{
    CommandOutput, Connection, ConnectionError, ConnectionFactory, ConnectionPool, PoolConfig,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for an SSH session: every command takes a little while
struct SimulatedSession {
    number: usize,
}

#[async_trait]
impl Connection for SimulatedSession {
    async fn execute(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(CommandOutput {
            stdout: format!("[session {}] {}", self.number, command),
            stderr: String::new(),
            exit_status: 0,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct SimulatedHost {
    opened: AtomicUsize,
}

#[async_trait]
impl ConnectionFactory for SimulatedHost {
    type Conn = SimulatedSession;

    async fn connect(&self) -> Result<SimulatedSession, ConnectionError> {
        // Handshake plus authentication
        tokio::time::sleep(Duration::from_millis(50)).await;
        let number = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SimulatedSession { number })
    }

    fn target(&self) -> String {
        "demo@localhost:22".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("=== EsoxSolutions.SessionPool ===");

    let config = PoolConfig::new()
        .with_max_active(3)
        .with_max_idle(2)
        .with_acquire_wait_timeout(Duration::from_secs(5));
    let pool = Arc::new(ConnectionPool::new(
        SimulatedHost { opened: AtomicUsize::new(0) },
        config,
    )?);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            let output = conn.execute(&format!("echo job-{}", i)).await;
            pool.release(conn).await;
            match output {
                Ok(output) => println!("  {}", output.stdout),
                Err(e) => println!("  job-{} failed: {}", i, e),
            }
            Ok::<_, esox_sessionpool::PoolError>(())
        }));
    }

    for task in tasks {
        task.await??;
    }

    let stats = pool.stats();
    println!();
    println!("Created: {}  Idle: {}  Closed: {}", stats.total_created, stats.idle, stats.total_closed);
    println!("Total wait: {:?}", stats.total_wait_time);
    println!();
    print!("{}", pool.export_metrics_prometheus("demo", None));

    pool.close().await?;
    Ok(())
}

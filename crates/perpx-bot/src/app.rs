//! Main application orchestration.
//!
//! Startup order matters:
//! 1. Preflight: chain id check, balance read, nonce sync
//! 2. Recovery: replay the operation log and resume in-flight operations
//! 3. Main loop: stdin commands, liquidation scans, shutdown signal

use std::sync::Arc;
use std::time::Duration;

use perpx_chain::{ChainClient, ChainGateway, RpcChainGateway};
use perpx_executor::{EngineDeps, ExecutionEngine, KeyManager, ResumeSummary, TxSigner};
use perpx_persistence::{replay, OperationJournal, OperationLog};
use perpx_position::PositionBook;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::inbound::CommandHandler;

/// Main application.
pub struct Application {
    config: AppConfig,
    client: ChainClient,
    engine: ExecutionEngine,
}

impl Application {
    /// Create the application against the configured JSON-RPC node and
    /// operation log.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let gateway: Arc<dyn ChainGateway> = Arc::new(RpcChainGateway::new(config.rpc_config())?);
        let log = OperationLog::open(&config.persistence.log_path)?;
        log.compact()?;
        let journal: Arc<dyn OperationJournal> = Arc::new(log);
        Self::with_parts(config, gateway, journal)
    }

    /// Create the application with an explicit gateway and journal.
    pub fn with_parts(
        config: AppConfig,
        gateway: Arc<dyn ChainGateway>,
        journal: Arc<dyn OperationJournal>,
    ) -> AppResult<Self> {
        let keys = KeyManager::load(config.key_source(), config.expected_address()?)?;
        let account = match keys.trading_address() {
            Some(address) => {
                info!(%address, "Trading key loaded");
                address
            }
            None => {
                let address = config.observation_address()?.ok_or_else(|| {
                    AppError::Config("no trading key and no observation address".into())
                })?;
                warn!(%address, "No trading key loaded, running observation-only");
                address
            }
        };

        let client = ChainClient::new(gateway, config.timeouts());
        let signer = Arc::new(TxSigner::new(Arc::new(keys), config.chain.expected_chain_id));
        let book = Arc::new(PositionBook::new(format!("{account:#x}")));
        let risk = Arc::new(config.risk_parameters()?);

        let engine = ExecutionEngine::new(
            EngineDeps {
                client: client.clone(),
                signer,
                book,
                risk,
                journal,
            },
            config.engine_config(account)?,
        );

        Ok(Self {
            config,
            client,
            engine,
        })
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn handler(&self) -> CommandHandler {
        CommandHandler::new(self.engine.clone(), self.config.execution.default_slippage_bps)
    }

    /// Verify the node before accepting any intent.
    ///
    /// A chain id mismatch is fatal. A low or unreadable collateral balance
    /// only warns.
    pub async fn run_preflight(&self) -> AppResult<()> {
        let expected = self.config.chain.expected_chain_id;
        let actual = self.client.chain_id().await?;
        if actual != expected {
            return Err(AppError::Preflight(format!(
                "chain id mismatch: node reports {actual}, expected {expected}"
            )));
        }
        info!(chain_id = actual, "Chain id verified");

        let account = self.engine.account();
        match self.client.get_balance(account).await {
            Ok(balance) if balance < self.config.monitor.low_balance_warning => {
                warn!(
                    %account,
                    %balance,
                    threshold = %self.config.monitor.low_balance_warning,
                    "Collateral balance is low"
                );
            }
            Ok(balance) => info!(%account, %balance, "Collateral balance"),
            Err(e) => warn!(%account, error = %e, "Collateral balance unavailable"),
        }

        let nonce = self.engine.sync_nonce().await?;
        info!(%account, nonce, "Nonce synchronized");
        Ok(())
    }

    /// Replay the operation log and resume unfinished operations.
    ///
    /// Run after [`Self::run_preflight`] so resumed nonces sit on top of
    /// the synced chain nonce.
    pub fn recover(&self) -> AppResult<ResumeSummary> {
        let records = replay(&self.config.persistence.log_path)?;
        let summary = self.engine.resume(records)?;
        info!(
            restored = summary.restored,
            resumed = summary.resumed,
            interrupted = summary.interrupted,
            terminal = summary.terminal,
            "Recovery complete"
        );
        Ok(summary)
    }

    /// One liquidation scan pass.
    pub async fn scan_liquidations(&self) -> usize {
        let flags = self.engine.scan_liquidation_risk().await;
        if flags.is_empty() {
            debug!(positions = self.engine.positions().len(), "Liquidation scan clean");
        } else {
            warn!(flagged = flags.len(), "Liquidation scan flagged positions");
        }
        flags.len()
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> AppResult<()> {
        let handler = self.handler();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        let mut stdin_open = true;

        let mut scan_interval = tokio::time::interval(Duration::from_millis(
            self.config.monitor.liquidation_scan_interval_ms,
        ));
        scan_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(account = %self.engine.account(), "Entering main event loop");
        let mut commands = 0u64;

        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            commands += 1;
                            let response = handler.handle_line(&line).await;
                            write_response(&mut stdout, &response).await?;
                        }
                        Ok(None) => {
                            info!("Command input closed, continuing until shutdown");
                            stdin_open = false;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to read command input");
                            stdin_open = false;
                        }
                    }
                }

                _ = scan_interval.tick() => {
                    self.scan_liquidations().await;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!(
            commands,
            operations = self.engine.operation_count(),
            open_positions = self.engine.positions().len(),
            "Shutting down"
        );
        Ok(())
    }
}

async fn write_response(stdout: &mut tokio::io::Stdout, response: &Value) -> AppResult<()> {
    let mut line = response.to_string();
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

//! Node assembly: wiring, startup order, graceful shutdown.
//!
//! Startup is fail-fast: a corrupt header store, an unbindable port or a
//! bad config aborts with a nonzero exit. Shutdown saves anchors, peer
//! tables, the ban list and the header store.

use crate::chain::chainstate::ChainstateManager;
use crate::chain::store::{restore_chain, HeaderStore};
use crate::config::Config;
use crate::errors::{NodeError, NodeResult};
use crate::metrics;
use crate::net::connman::{load_addrman, ConnMan, NetConfig};
use crate::net::peer::ConnType;
use crate::pow::PowEngine;
use crate::rpc::{self, RpcState};
use crate::timedata::{unix_now, TimeData};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Node {
    pub config: Config,
    pub chainstate: Arc<ChainstateManager>,
    pub connman: Arc<ConnMan>,
    header_store: HeaderStore,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub async fn start(config: Config) -> NodeResult<Node> {
        let params = Arc::new(config.params());
        info!(
            network = params.network.name(),
            datadir = %config.datadir.display(),
            "starting node"
        );
        info!(pow = params.pow.fingerprint(), "consensus parameters");

        // size the validation worker pool; ignore the error if a pool was
        // already installed (tests)
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build_global();

        let timedata = Arc::new(TimeData::new());
        let pow = Arc::new(PowEngine::new(params.pow, params.chain_seed));
        let chainstate = Arc::new(ChainstateManager::new(
            Arc::clone(&params),
            pow,
            Arc::clone(&timedata),
        ));

        let header_store = HeaderStore::new(&config.datadir);
        restore_chain(&header_store, &chainstate)?;

        let addrman = load_addrman(&config.datadir);
        let net_cfg = NetConfig {
            listen: config.listen,
            port: config.port,
            ..NetConfig::for_port(config.port)
        };
        let connman = ConnMan::new(
            net_cfg,
            Arc::clone(&chainstate),
            Arc::clone(&timedata),
            addrman,
            config.datadir.clone(),
        );

        let mut tasks = Vec::new();

        if config.listen {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
                .await
                .map_err(|e| {
                    NodeError::Config(format!("cannot bind p2p port {}: {e}", config.port))
                })?;
            info!(port = config.port, "p2p listener bound");
            tasks.push(tokio::spawn(Arc::clone(&connman).run_listener(listener)));
        }
        tasks.push(tokio::spawn(Arc::clone(&connman).maintenance()));

        let rpc_listener = tokio::net::TcpListener::bind(("127.0.0.1", config.rpc_port))
            .await
            .map_err(|e| {
                NodeError::Config(format!("cannot bind rpc port {}: {e}", config.rpc_port))
            })?;
        info!(port = config.rpc_port, "rpc listener bound");
        let rpc_state = Arc::new(RpcState {
            chainstate: Arc::clone(&chainstate),
            connman: Arc::clone(&connman),
            network: params.network,
            started_at: unix_now(),
        });
        tasks.push(tokio::spawn(rpc::serve(rpc_state, rpc_listener)));

        // announce tip changes to peers; track the height gauge
        {
            let mut tip_rx = chainstate.subscribe_tip();
            let cm = Arc::clone(&connman);
            tasks.push(tokio::spawn(async move {
                loop {
                    match tip_rx.recv().await {
                        Ok(change) => {
                            metrics::TIP_HEIGHT.set(change.height as i64);
                            cm.sync.announce_tip(&cm, change.id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "tip notifications lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // periodic header-store checkpoint
        {
            let cs = Arc::clone(&chainstate);
            let store = HeaderStore::new(&config.datadir);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                tick.tick().await; // skip the immediate first tick
                loop {
                    tick.tick().await;
                    if let Err(err) = store.save(&cs.headers_for_store()) {
                        warn!(%err, "periodic header store save failed");
                    }
                }
            }));
        }

        // manual connections requested on the command line
        for target in &config.connect {
            match target.parse::<std::net::SocketAddr>() {
                Ok(addr) => {
                    let cm = Arc::clone(&connman);
                    tokio::spawn(async move {
                        cm.connect_outbound(addr, ConnType::Manual).await;
                    });
                }
                Err(_) => {
                    let cm = Arc::clone(&connman);
                    let target = target.clone();
                    tokio::spawn(async move {
                        match tokio::net::lookup_host(&target).await {
                            Ok(mut addrs) => {
                                if let Some(addr) = addrs.next() {
                                    cm.connect_outbound(addr, ConnType::Manual).await;
                                }
                            }
                            Err(err) => error!(%target, %err, "cannot resolve --connect"),
                        }
                    });
                }
            }
        }

        Ok(Node {
            config,
            chainstate,
            connman,
            header_store,
            tasks,
        })
    }

    /// Graceful shutdown: persist everything, stop the tasks.
    pub async fn shutdown(self) -> NodeResult<()> {
        info!("shutting down");
        self.connman.shutdown().await;
        self.header_store
            .save(&self.chainstate.headers_for_store())?;
        for task in self.tasks {
            task.abort();
        }
        let tip = self.chainstate.tip();
        info!(height = tip.height, tip = %tip.id, "shutdown complete");
        Ok(())
    }
}

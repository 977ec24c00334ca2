use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{api, ca::Ca, config::Config, proxy, storage::Storage};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Running server: the proxy listener, the admin API listener, and the
/// shared storage behind them.
pub struct ServerHandle {
    pub proxy_addr: SocketAddr,
    pub api_addr: SocketAddr,
    storage: Arc<Storage>,
    proxy: proxy::ProxyHandle,
    api: api::ApiHandle,
}

pub async fn serve(config: Config) -> anyhow::Result<ServerHandle> {
    let storage = Arc::new(
        Storage::from_config(&config)
            .map_err(|err| anyhow::anyhow!("initialize storage: {err}"))?,
    );
    let ca = Arc::new(Ca::generate()?);

    let proxy = proxy::serve(&config, Arc::clone(&storage), Arc::clone(&ca)).await?;
    let api = api::serve(&config, Arc::clone(&storage), Arc::clone(&ca)).await?;

    Ok(ServerHandle {
        proxy_addr: proxy.listen_addr,
        api_addr: api.listen_addr,
        storage,
        proxy,
        api,
    })
}

impl ServerHandle {
    /// Stops both listeners with a short grace window, then persists the
    /// index. Shutdown errors are logged, not propagated.
    pub async fn shutdown(self) {
        let stop = async {
            self.proxy.shutdown().await;
            self.api.shutdown().await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, stop).await.is_err() {
            tracing::warn!("listener shutdown exceeded the grace period");
        }
        if let Err(err) = self.storage.flush() {
            tracing::warn!("flush storage index on shutdown: {err}");
        }
    }
}

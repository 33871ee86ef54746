use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

use crate::common::models::{GeoPoint, PodType, Visibility};
use crate::server::communities;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::embedding::EmbeddingProvider;
use crate::server::geo::GeoResolver;
use crate::server::rooms::RoomRegistry;
use crate::server::search::{SearchMode, SearchService};

#[derive(Debug, Deserialize)]
struct CreateCommunityRequest {
    name: String,
    tags: Vec<String>,
    description: String,
    visibility: Option<String>,
    lng: Option<f64>,
    lat: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CreatePodRequest {
    community_id: String,
    pod_type: Option<String>,
    title: Option<String>,
    duration_hours: Option<i64>,
    lng: Option<f64>,
    lat: Option<f64>,
}

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub registry: Arc<RoomRegistry>,
    pub search: Arc<SearchService>,
    pub geo: Arc<dyn GeoResolver>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    clients: AtomicUsize,
}

impl Server {
    pub fn new(
        db: Arc<Database>,
        config: ServerConfig,
        registry: Arc<RoomRegistry>,
        search: Arc<SearchService>,
        geo: Arc<dyn GeoResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            db,
            config,
            registry,
            search,
            geo,
            embedder,
            clients: AtomicUsize::new(0),
        }
    }

    /// Configure TLS acceptor from environment variables.
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_tls {
            return Ok(None);
        }

        let cert_path = std::env::var("TLS_CERT_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_CERT_PATH environment variable not set"))?;
        let key_path = std::env::var("TLS_KEY_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_KEY_PATH environment variable not set"))?;

        let cert_file = File::open(&cert_path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
        let mut cert_reader = StdBufReader::new(cert_file);
        let cert_chain = certs(&mut cert_reader)?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
        }

        let key_file = File::open(&key_path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
        let mut key_reader = StdBufReader::new(key_file);

        // Try PKCS8 first, then RSA
        let mut keys = pkcs8_private_keys(&mut key_reader)?;
        if keys.is_empty() {
            let key_file = File::open(&key_path)?;
            let mut key_reader = StdBufReader::new(key_file);
            keys = rsa_private_keys(&mut key_reader)?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("No private keys found in {}", key_path));
        }

        let priv_key = rustls::PrivateKey(keys.remove(0));
        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, priv_key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        info!("[TLS] TLS configuration successful");
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[SERVER] Listening on {}", addr);

        let tls_acceptor = match self.setup_tls_acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!("[TLS] TLS configuration failed: {}; falling back to plain TCP", e);
                None
            }
        };

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            let acceptor = tls_acceptor.clone();

            if server.clients.load(Ordering::SeqCst) >= server.config.max_clients {
                warn!("[SERVER] Rejecting {}: server full", peer);
                continue;
            }

            tokio::spawn(async move {
                server.clients.fetch_add(1, Ordering::SeqCst);
                let result = if let Some(acceptor) = acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.handle_stream(tls_stream, peer).await,
                        Err(e) => {
                            error!("[SERVER] TLS accept failed for {}: {}", peer, e);
                            Ok(())
                        }
                    }
                } else {
                    server.handle_stream(stream, peer).await
                };
                if let Err(e) = result {
                    error!("[SERVER] Client error ({}): {}", peer, e);
                }
                server.clients.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn handle_stream<S>(&self, stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let cmd = parts.next().unwrap_or("");
            let args: Vec<&str> = parts.collect();

            let response = self.handle_command(cmd, &args, peer).await;
            write_half.write_all(response.as_bytes()).await?;
            write_half.write_all(b"\n").await?;
            if cmd == "/quit" {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle_command(&self, cmd: &str, args: &[&str], peer: SocketAddr) -> String {
        info!("[SERVER] Received command: {} ({} args)", cmd, args.len());
        match cmd {
            // DISCOVERY
            "/search" if args.len() >= 5 => {
                let user_id = args[0];
                let Some(mode) = SearchMode::parse(args[1]) else {
                    return "ERR: Mode must be 'local' or 'global'".to_string();
                };
                let (Ok(lng), Ok(lat)) = (args[2].parse::<f64>(), args[3].parse::<f64>()) else {
                    return "ERR: Bad coordinates".to_string();
                };
                let point = GeoPoint::new(lng, lat);
                let user_geo = if point.is_known() { Some(point) } else { None };
                let query = args[4..].join(" ");

                let outcome = self.search.search(&query, mode, user_geo, user_id).await;
                match serde_json::to_string(&outcome) {
                    Ok(json) => format!("OK: {}", json),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/trending" => {
                let communities = communities::trending(self.db.clone()).await;
                format!("OK: {}", serde_json::to_string(&communities).unwrap_or_else(|_| "[]".into()))
            }
            "/nearby" if args.len() == 2 => {
                let (Ok(lng), Ok(lat)) = (args[0].parse::<f64>(), args[1].parse::<f64>()) else {
                    return "ERR: Bad coordinates".to_string();
                };
                let found = communities::nearby(
                    self.db.clone(),
                    GeoPoint::new(lng, lat),
                    self.config.search_radius_m,
                )
                .await;
                format!("OK: {}", serde_json::to_string(&found).unwrap_or_else(|_| "[]".into()))
            }
            "/locate" => {
                let location = self.geo.resolve(&peer.ip().to_string()).await;
                format!("OK: {}", serde_json::to_string(&location).unwrap_or_else(|_| "{}".into()))
            }

            // COMMUNITIES
            "/create_community" if args.len() >= 2 => {
                let user_id = args[0];
                let payload = args[1..].join(" ");
                let req: CreateCommunityRequest = match serde_json::from_str(&payload) {
                    Ok(req) => req,
                    Err(e) => return format!("ERR: Bad payload: {}", e),
                };
                let visibility = match req.visibility.as_deref() {
                    None => Visibility::Global,
                    Some(raw) => match Visibility::parse(raw) {
                        Some(v) => v,
                        None => return "ERR: Visibility must be 'local' or 'global'".to_string(),
                    },
                };
                let geo = match (req.lng, req.lat) {
                    (Some(lng), Some(lat)) => GeoPoint::new(lng, lat),
                    _ => GeoPoint::UNKNOWN,
                };
                match communities::create_community(
                    self.db.clone(),
                    self.embedder.as_ref(),
                    user_id,
                    &req.name,
                    &req.tags,
                    &req.description,
                    visibility,
                    geo,
                    Some(&peer.ip().to_string()),
                )
                .await
                {
                    Ok(community) => format!(
                        "OK: {}",
                        serde_json::to_string(&community).unwrap_or_else(|_| "{}".into())
                    ),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/community" if args.len() == 1 => {
                match communities::get_community(self.db.clone(), args[0]).await {
                    Ok(community) => format!(
                        "OK: {}",
                        serde_json::to_string(&community).unwrap_or_else(|_| "{}".into())
                    ),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/join_community" if args.len() == 2 => {
                match communities::join_community(self.db.clone(), args[1], args[0]).await {
                    Ok(()) => "OK: Joined".to_string(),
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/leave_community" if args.len() == 2 => {
                match communities::leave_community(self.db.clone(), args[1], args[0]).await {
                    Ok(()) => "OK: Left".to_string(),
                    Err(e) => format!("ERR: {}", e),
                }
            }

            // PODS
            "/create_pod" if args.len() >= 2 => {
                let user_id = args[0];
                let payload = args[1..].join(" ");
                let req: CreatePodRequest = match serde_json::from_str(&payload) {
                    Ok(req) => req,
                    Err(e) => return format!("ERR: Bad payload: {}", e),
                };
                let pod_type = match req.pod_type.as_deref() {
                    None => PodType::Chat,
                    Some(raw) => match PodType::parse(raw) {
                        Some(t) => t,
                        None => return "ERR: Unknown pod type".to_string(),
                    },
                };
                let geo = match (req.lng, req.lat) {
                    (Some(lng), Some(lat)) => Some(GeoPoint::new(lng, lat)),
                    _ => None,
                };
                match self
                    .registry
                    .create_pod(&req.community_id, user_id, pod_type, req.title, req.duration_hours, geo)
                    .await
                {
                    Ok(pod) => {
                        format!("OK: {}", serde_json::to_string(&pod).unwrap_or_else(|_| "{}".into()))
                    }
                    Err(e) => format!("ERR: {}", e),
                }
            }
            "/pod" if args.len() == 1 => match self.registry.get_pod(args[0]).await {
                Ok(pod) => format!("OK: {}", serde_json::to_string(&pod).unwrap_or_else(|_| "{}".into())),
                Err(e) => format!("ERR: {}", e),
            },
            "/active_pods" => {
                let community_id = args.first().copied();
                let pods = self.registry.active_pods(community_id).await;
                format!("OK: {}", serde_json::to_string(&pods).unwrap_or_else(|_| "[]".into()))
            }
            "/join_pod" if args.len() == 2 => {
                match self.registry.join(args[1], args[0]).await {
                    Ok(snapshot) => format!(
                        "OK: {}",
                        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".into())
                    ),
                    Err(e) => format!("ERR: {}", e),
                }
            }

            // SYSTEM
            "/help" => {
                "OK: Commands: /search <user> <mode> <lng> <lat> <query>, /trending, \
                 /nearby <lng> <lat>, /locate, /create_community <user> <json>, \
                 /community <id>, /join_community <user> <id>, /leave_community <user> <id>, \
                 /create_pod <user> <json>, /pod <id>, /active_pods [community], \
                 /join_pod <user> <pod>, /quit"
                    .to_string()
            }
            "/quit" => "OK: Disconnected".to_string(),
            _ => "ERR: Unknown command (try /help)".to_string(),
        }
    }
}

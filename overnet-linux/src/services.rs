//! TCP service bridging. Exports accept mesh streams and connect them to a
//! local TCP service; forwards accept local TCP connections and carry them
//! to a node offering the service.

use std::collections::BTreeMap;

use overnet_core::{
    BridgeFactory, Introduction, ReliabilityAndOrdering, RouterEndpoint, Status, Stream,
};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Forward;

/// Register every export and serve incoming streams until the endpoint
/// closes.
pub async fn serve_exports(
    endpoint: RouterEndpoint,
    factory: BridgeFactory,
    exports: BTreeMap<String, String>,
) {
    for name in exports.keys() {
        endpoint.register_service(name.clone());
        info!(service = %name, target = %exports[name], "exporting");
    }
    loop {
        let intro = match endpoint.recv_intro().await {
            Ok(intro) => intro,
            Err(status) => {
                debug!(%status, "no longer accepting streams");
                return;
            }
        };
        let service = intro.introduction.service_name;
        let Some(target) = exports.get(&service).cloned() else {
            warn!(%service, peer = %intro.new_stream.peer(), "stream for unknown service");
            intro
                .new_stream
                .fail(Status::not_found(format!("no service {:?}", service)));
            continue;
        };
        let stream = Stream::new(intro.new_stream);
        let factory = factory.clone();
        tokio::task::spawn_local(async move {
            match TcpStream::connect(&target).await {
                Ok(tcp) => {
                    debug!(%service, peer = %stream.peer(), %target, "stream connected");
                    factory.bind_socket(stream, tcp);
                }
                Err(e) => {
                    warn!(%service, %target, error = %e, "cannot reach exported service");
                    stream
                        .close(Status::from(e).with_context(format!("connecting {}", target)))
                        .await;
                }
            }
        });
    }
}

/// Accept local connections on `forward.listen` and bridge each to a node
/// currently offering `forward.service`.
pub async fn run_forward(
    endpoint: RouterEndpoint,
    factory: BridgeFactory,
    forward: Forward,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(forward.listen).await?;
    info!(listen = %forward.listen, service = %forward.service, "forwarding");
    loop {
        let (tcp, from) = listener.accept().await?;
        let nodes = endpoint.nodes_offering(&forward.service);
        let Some(&node) = nodes.choose(&mut rand::thread_rng()) else {
            warn!(%from, service = %forward.service, "no node offers service");
            continue;
        };
        let new_stream = match endpoint.initiate_stream(
            node,
            ReliabilityAndOrdering::ReliableOrdered,
            Introduction::new(forward.service.clone()),
        ) {
            Ok(new_stream) => new_stream,
            Err(status) => {
                warn!(%from, %node, %status, "cannot open stream");
                continue;
            }
        };
        debug!(%from, %node, service = %forward.service, "forwarding connection");
        factory.bind_socket(Stream::new(new_stream), tcp);
    }
}

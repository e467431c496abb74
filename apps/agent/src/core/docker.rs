//! Shared Docker engine access. Both the provider and the OVS plugin talk to
//! the same daemon; connection setup and a few cross-cutting helpers live
//! here.

use anyhow::{Context, Result};
use bollard::Docker;

use crate::config::settings;

/// Connect to the engine named by `ARCHETYPE_AGENT_DOCKER_SOCKET`.
pub fn connect() -> Result<Docker> {
    let socket = &settings().docker_socket;
    let docker = if let Some(path) = socket.strip_prefix("unix://") {
        Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
    } else if socket.starts_with("http://") || socket.starts_with("tcp://") {
        Docker::connect_with_http(socket, 120, bollard::API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_unix(socket, 120, bollard::API_DEFAULT_VERSION)
    };
    docker.with_context(|| format!("failed to connect to docker at {socket}"))
}

/// PID of a running container's init process, for nsenter operations.
pub async fn container_pid(docker: &Docker, name: &str) -> Result<Option<u32>> {
    let inspect = match docker.inspect_container(name, None).await {
        Ok(inspect) => inspect,
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
            return Ok(None)
        }
        Err(err) => return Err(err.into()),
    };
    let state = inspect.state.unwrap_or_default();
    if state.running != Some(true) {
        tracing::warn!(container = name, "container is not running");
        return Ok(None);
    }
    Ok(state.pid.map(|pid| pid as u32))
}

/// Whether a container exists at all (any state).
pub async fn container_exists(docker: &Docker, name: &str) -> bool {
    docker.inspect_container(name, None).await.is_ok()
}

pub async fn connect_network(docker: &Docker, network: &str, container: &str) -> Result<()> {
    use bollard::network::ConnectNetworkOptions;
    match docker
        .connect_network(
            network,
            ConnectNetworkOptions {
                container,
                ..Default::default()
            },
        )
        .await
    {
        Ok(()) => Ok(()),
        // Already connected is success for our purposes.
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 403, message })
            if message.contains("already exists") =>
        {
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn disconnect_network(docker: &Docker, network: &str, container: &str) -> Result<()> {
    use bollard::network::DisconnectNetworkOptions;
    docker
        .disconnect_network(
            network,
            DisconnectNetworkOptions {
                container,
                force: true,
            },
        )
        .await?;
    Ok(())
}

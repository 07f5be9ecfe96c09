use mallcoord::store::{AtomicScriptRunner, RedisScriptRunner};
use std::sync::Arc;
use testcontainers::{
	ContainerAsync, GenericImage,
	core::{ContainerPort, WaitFor},
	runners::AsyncRunner,
};

/// A throwaway Redis server; stopped when dropped.
pub struct RedisFixture {
	_container: ContainerAsync<GenericImage>,
	pub url: String,
}

impl RedisFixture {
	pub async fn start() -> Self {
		let container = GenericImage::new("redis", "7-alpine")
			.with_exposed_port(ContainerPort::Tcp(6379))
			.with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
			.start()
			.await
			.expect("Failed to start Redis container");
		let port = container
			.get_host_port_ipv4(6379)
			.await
			.expect("Failed to get port");
		Self {
			_container: container,
			url: format!("redis://127.0.0.1:{port}/"),
		}
	}

	pub async fn runner(&self) -> Arc<dyn AtomicScriptRunner> {
		Arc::new(
			RedisScriptRunner::new(&self.url)
				.await
				.expect("Failed to connect to Redis"),
		)
	}
}

use std::process;

use tracing::error;

#[tokio::main]
async fn main() {
	if let Err(e) = vinegar::run().await {
		error!(
			"An unrecoverable error has occurred and the application will exit: {}",
			e
		);
		process::exit(e.exit_code());
	}
}

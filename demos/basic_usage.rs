use batch_pool::{PoolError, TaskPoolBuilder};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn lookup_user(id: u64) -> Result<String, String> {
  let delay_ms = 100 + (id % 3) * 150;
  info!("Lookup {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  Ok(format!("user-{}", id))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let ids: Vec<u64> = vec![42, 7, 19, 3, 88, 61];
  let names = Arc::new(Mutex::new(vec![String::new(); ids.len()]));
  let names_for_collator = names.clone();

  let pool = TaskPoolBuilder::new("basic_pool", lookup_user)
    .size(2)
    .submit_timeout_ms(2000)
    .collate(move |seq, result: Result<String, String>| {
      let name = result?;
      names_for_collator.lock().unwrap()[seq as usize] = name;
      Ok(())
    })
    .init(Handle::current());

  for id in &ids {
    if let Err(e) = pool.process(*id).await {
      tracing::error!("Failed to submit lookup {}: {}", id, e);
      break;
    }
  }

  info!("All lookups submitted. Joining pool...");
  match pool.join().await {
    Ok(()) => info!("Lookups in submission order: {:?}", names.lock().unwrap()),
    Err(PoolError::Task(e)) => info!("A lookup failed: {}", e),
    Err(e) => info!("Pool failed: {}", e),
  }
  info!("--- Basic Usage Example End ---");
}

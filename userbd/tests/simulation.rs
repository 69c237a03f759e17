//! Randomized request sequences checked against a byte-level oracle.
//!
//! Set `DST_SEED` to replay a failing run:
//!
//! ```bash
//! DST_SEED=1234 cargo test -p userbd --test simulation
//! ```

use std::sync::Arc;

use nbd::{NBD_EPERM, NbdClient, NbdError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{DuplexStream, duplex};
use tokio::task::JoinHandle;
use userbd::{MemoryDevice, NbdServer, TransmissionExit};

const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
enum Action {
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: Vec<u8> },
    Trim { offset: u64, length: u32 },
    Flush,
}

#[derive(Debug, Default)]
struct Stats {
    operations: u64,
    reads: u64,
    writes: u64,
    trims: u64,
    flushes: u64,
}

struct Harness {
    rng: SmallRng,
    client: NbdClient<DuplexStream>,
    server: JoinHandle<Result<TransmissionExit, NbdError>>,
    device: Arc<MemoryDevice>,
    oracle: Vec<u8>,
    stats: Stats,
}

impl Harness {
    fn new(seed: u64, size_bytes: u64) -> Self {
        let device = Arc::new(MemoryDevice::new(size_bytes as usize));
        let server = NbdServer::new(device.clone(), size_bytes);
        let (client_stream, server_stream) = duplex(64 * 1024);
        let server = tokio::spawn(async move { server.serve(server_stream).await });

        Self {
            rng: SmallRng::seed_from_u64(seed),
            client: NbdClient::new(client_stream),
            server,
            device,
            oracle: vec![0u8; size_bytes as usize],
            stats: Stats::default(),
        }
    }

    fn sample_range(&mut self, max_len: u32) -> (u64, u32) {
        let size = self.oracle.len() as u64;
        let length = self.rng.random_range(1..=max_len.min(size as u32));
        let offset = self.rng.random_range(0..=size - u64::from(length));
        (offset, length)
    }

    fn sample_action(&mut self) -> Action {
        match self.rng.random_range(0..100) {
            0..45 => {
                let (offset, length) = self.sample_range(32 * 1024);
                Action::Read { offset, length }
            }
            45..85 => {
                let (offset, length) = self.sample_range(32 * 1024);
                let data = (0..length).map(|_| self.rng.random()).collect();
                Action::Write { offset, data }
            }
            85..92 => {
                let (offset, length) = self.sample_range(64 * 1024);
                Action::Trim { offset, length }
            }
            _ => Action::Flush,
        }
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::Read { offset, length } => {
                let data = self.client.read(offset, length).await.unwrap();
                let start = offset as usize;
                let expected = &self.oracle[start..start + length as usize];
                assert!(
                    &data[..] == expected,
                    "read mismatch at offset {offset} length {length}"
                );
                self.stats.reads += 1;
            }
            Action::Write { offset, data } => {
                self.client.write(offset, &data).await.unwrap();
                let start = offset as usize;
                self.oracle[start..start + data.len()].copy_from_slice(&data);
                self.stats.writes += 1;
            }
            Action::Trim { offset, length } => {
                // Discard is refused; contents must stay untouched.
                match self.client.trim(offset, length).await {
                    Err(NbdError::ServerError { code }) => assert_eq!(code, NBD_EPERM),
                    other => panic!("trim should be refused, got {other:?}"),
                }
                self.stats.trims += 1;
            }
            Action::Flush => {
                self.client.flush().await.unwrap();
                self.stats.flushes += 1;
            }
        }
        self.stats.operations += 1;
    }

    async fn run(mut self, operations: u64) -> Stats {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await;
        }

        let _stream = self.client.disconnect().await.unwrap();
        let exit = self.server.await.unwrap().unwrap();
        assert_eq!(exit, TransmissionExit::Disconnected);
        assert!(self.device.snapshot().await == self.oracle, "final contents diverged");
        self.stats
    }
}

/// Get the seed from environment or generate a random one.
fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}

fn run_simulation(size_bytes: u64, operations: u64) {
    let seed = get_seed();
    eprintln!("NBD simulation: seed={seed}, size={size_bytes}, ops={operations}");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let stats = runtime.block_on(async { Harness::new(seed, size_bytes).run(operations).await });
    eprintln!("NBD simulation complete: {stats:?}");
    assert_eq!(stats.operations, operations);
}

#[test]
fn nbd_simulation() {
    run_simulation(BLOCK_SIZE * 16, 200);
}

#[test]
#[ignore]
fn nbd_simulation_long() {
    run_simulation(BLOCK_SIZE * 256, 10_000);
}

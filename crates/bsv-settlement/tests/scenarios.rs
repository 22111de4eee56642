//! Settlement flows against an in-process ElectrumX line server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bsv_electrum::{PoolConfig, ServerEndpoint, Transport};
use bsv_script::address_to_script_hash;
use bsv_settlement::config::MonitorConfig;
use bsv_settlement::memory::*;
use bsv_settlement::{
    Collaborators, FeeTier, KeyDerivationEngine, MerchantWallet, OwnedAddress, SendRequest, SettlementConfig,
    SettlementError, SettlementService,
};
use bsv_transaction::Transaction;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const SEED: [u8; 32] = [0x42; 32];

/// Per-script-hash answers, keyed by the hex script hash.
#[derive(Default)]
struct Ledger {
    statuses: HashMap<String, Value>,
    balances: HashMap<String, i64>,
    unspent: HashMap<String, Value>,
    broadcasts: Vec<String>,
}

struct FakeElectrum {
    addr: SocketAddr,
    ledger: Arc<Mutex<Ledger>>,
    pushes: broadcast::Sender<String>,
    task: JoinHandle<()>,
}

impl FakeElectrum {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let (pushes, _) = broadcast::channel(16);
        let task = tokio::spawn({
            let ledger = ledger.clone();
            let pushes = pushes.clone();
            async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else { return };
                    tokio::spawn(serve_connection(socket, ledger.clone(), pushes.subscribe()));
                }
            }
        });
        FakeElectrum {
            addr,
            ledger,
            pushes,
            task,
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().expect("ledger")
    }

    fn push_status(&self, script_hash: &str, status: &str) {
        let line = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.scripthash.subscribe",
            "params": [script_hash, status],
        });
        let _ = self.pushes.send(line.to_string());
    }
}

async fn serve_connection(
    socket: tokio::net::TcpStream,
    ledger: Arc<Mutex<Ledger>>,
    mut pushes: broadcast::Receiver<String>,
) {
    let (read, mut write) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                return;
            }
        }
    });
    let push_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(line) = pushes.recv().await {
            if push_tx.send(line).is_err() {
                return;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let req: Value = serde_json::from_str(&line).expect("json request");
        let key = req["params"][0].as_str().unwrap_or_default().to_string();
        let result = {
            let mut ledger = ledger.lock().expect("ledger");
            match req["method"].as_str().unwrap_or_default() {
                "server.version" => json!(["FakeX 1.0", "1.4"]),
                "server.ping" => Value::Null,
                "blockchain.scripthash.subscribe" => ledger.statuses.get(&key).cloned().unwrap_or(Value::Null),
                "blockchain.scripthash.unsubscribe" => json!(true),
                "blockchain.scripthash.get_balance" => {
                    json!({"confirmed": ledger.balances.get(&key).copied().unwrap_or(0), "unconfirmed": 0})
                }
                "blockchain.scripthash.get_history" => json!([]),
                "blockchain.scripthash.listunspent" => ledger.unspent.get(&key).cloned().unwrap_or(json!([])),
                "blockchain.headers.subscribe" => json!({"height": 800_000, "hex": ""}),
                "blockchain.transaction.broadcast" => {
                    let tx = Transaction::from_hex(&key).expect("broadcast hex");
                    ledger.broadcasts.push(key.clone());
                    json!(tx.tx_id_hex())
                }
                _ => Value::Null,
            }
        };
        let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
        if out_tx.send(reply.to_string()).is_err() {
            break;
        }
    }
    forwarder.abort();
    writer.abort();
}

fn config(addr: SocketAddr) -> SettlementConfig {
    let mut config = SettlementConfig {
        pool: PoolConfig {
            servers: vec![ServerEndpoint::new(addr.ip().to_string(), addr.port(), Transport::Tcp, 0)],
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(100),
            startup_grace: Duration::from_secs(2),
            ..PoolConfig::default()
        },
        monitor: MonitorConfig {
            reconnect_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
        },
        ..SettlementConfig::default()
    };
    config.wallet.dust_limit = 546;
    config
}

struct Harness {
    server: FakeElectrum,
    primary: String,
    service: SettlementService,
    store: Arc<MemoryMerchantStore>,
    notifier: Arc<RecordingNotifier>,
    cache: Arc<RecordingCache>,
}

async fn harness() -> Harness {
    let server = FakeElectrum::start().await;
    let config = config(server.addr);

    let engine = KeyDerivationEngine::new(config.wallet.network);
    let base = config.wallet.base_path().expect("base");
    let primary = engine.derive_primary(&SEED, &base).expect("primary");

    let store = Arc::new(MemoryMerchantStore::new());
    store.insert_wallet(MerchantWallet {
        merchant_id: "m1".into(),
        encrypted_seed: SEED.to_vec(),
        base_path: None,
        stored_address: Some(primary.address.address_string.clone()),
    });
    store.add_address(
        "m1",
        OwnedAddress {
            address: primary.address.address_string.clone(),
            path: primary.path.clone(),
            invoice_id: None,
        },
    );

    let notifier = Arc::new(RecordingNotifier::default());
    let cache = Arc::new(RecordingCache::default());
    let services = Collaborators {
        store: store.clone(),
        seeds: Arc::new(PlaintextSeeds),
        counter: Arc::new(MemoryInvoiceCounter::new()),
        cache: cache.clone(),
        notifier: notifier.clone(),
    };
    let service = SettlementService::start(config, services).expect("service");

    for _ in 0..200 {
        if service.monitor().channel_server().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.monitor().channel_server().is_some(), "monitor never got a channel");

    Harness {
        server,
        primary: primary.address.address_string.clone(),
        service,
        store,
        notifier,
        cache,
    }
}

fn hash_hex(address: &str) -> String {
    address_to_script_hash(address).expect("script hash").to_string()
}

fn utxo(byte: u8, value: u64) -> Value {
    json!([{"tx_hash": hex::encode([byte; 32]), "tx_pos": 0, "height": 100, "value": value}])
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_invoice_payment_then_send() {
    let h = harness().await;

    // Primary already holds 500,000.
    {
        let mut ledger = h.server.ledger();
        let primary = hash_hex(&h.primary);
        ledger.statuses.insert(primary.clone(), json!("p1"));
        ledger.balances.insert(primary.clone(), 500_000);
        ledger.unspent.insert(primary, utxo(0xaa, 500_000));
    }
    assert_eq!(h.service.watch_merchant("m1").await.expect("watch"), 1);
    assert_eq!(h.store.stored_balance("m1"), 500_000);

    // Issue an invoice address; the platform records it with the order.
    let invoice = h.service.create_invoice_address("m1", "order-1").await.expect("invoice");
    assert_eq!(invoice.index, 0);
    assert_eq!(invoice.path.to_string(), "m/44'/236'/0'/1/0");
    h.store.add_address(
        "m1",
        OwnedAddress {
            address: invoice.address.clone(),
            path: invoice.path.clone(),
            invoice_id: Some("order-1".into()),
        },
    );

    // The customer pays 200,000 and the server pushes the new status.
    let invoice_hash = hash_hex(&invoice.address);
    {
        let mut ledger = h.server.ledger();
        ledger.statuses.insert(invoice_hash.clone(), json!("i1"));
        ledger.balances.insert(invoice_hash.clone(), 200_000);
        ledger.unspent.insert(invoice_hash.clone(), utxo(0xbb, 200_000));
    }
    h.server.push_status(&invoice_hash, "i1");
    let notifier = h.notifier.clone();
    eventually("invoice payment event", || {
        notifier.events().iter().any(|e| e.payload["incoming"] == json!(200_000))
    })
    .await;
    assert_eq!(h.store.stored_balance("m1"), 700_000);
    let last = h.notifier.events().last().cloned().expect("event");
    assert_eq!(last.event, "balance_update");
    assert_eq!(last.payload["incoming"], json!(200_000));
    assert_eq!(last.payload["address"], json!(invoice.address));
    assert_eq!(last.payload["invoice_id"], json!("order-1"));

    // A repeated push of the same status changes nothing.
    let events = h.notifier.events().len();
    h.server.push_status(&invoice_hash, "i1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.notifier.events().len(), events);

    // Spend across both addresses.
    let request = SendRequest {
        merchant_id: "m1".into(),
        destination: bsv_script::Address::from_public_key_hash(&[5; 20], bsv_script::Network::Mainnet)
            .address_string,
        amount: 600_000,
        tier: FeeTier::Low,
    };
    let receipt = h.service.send(&request).await.expect("send");
    assert_eq!(receipt.inputs, 2);
    assert_eq!(receipt.fee, 374);
    assert_eq!(receipt.change, 99_626);
    assert_eq!(h.server.ledger().broadcasts, vec![receipt.raw_hex.clone()]);
    assert!(h.cache.chain_height_invalidations() >= 1);

    assert!(h.service.expire_invoice_address(&invoice.address).await.expect("expire"));
    h.service.shutdown().await;
    h.server.task.abort();
}

#[tokio::test]
async fn test_send_fails_cleanly_when_short() {
    let h = harness().await;
    let err = h
        .service
        .send(&SendRequest {
            merchant_id: "m1".into(),
            destination: bsv_script::Address::from_public_key_hash(&[5; 20], bsv_script::Network::Mainnet)
                .address_string,
            amount: 10_000,
            tier: FeeTier::Medium,
        })
        .await
        .expect_err("nothing to spend");
    assert!(matches!(err, SettlementError::InsufficientFunds { available: 0, .. }));
    assert!(h.server.ledger().broadcasts.is_empty());
    h.service.shutdown().await;
    h.server.task.abort();
}

use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use raid5::client::{Client, ClientError};
use raid5::config::{ArrayConfig, BackendConfig, DegradedWrite, FrontendConfig};
use raid5::disk_manager::{DiskSnapshot, DiskStatus, Management};
use raid5::error::ServiceError;
use raid5::server::{BackendServer, FrontendServer};

const DATA_DISKS: usize = 3;
const BLOCK_SIZE: usize = 64;
const BLOCKS: u64 = 8;

fn frontend(degraded_writes: DegradedWrite) -> FrontendServer {
    let array = ArrayConfig {
        data_disks: DATA_DISKS,
        block_size: BLOCK_SIZE,
        blocks_per_disk: BLOCKS,
        backends: (0..=DATA_DISKS).map(|i| format!("disk-{i}")).collect(),
    };
    let mut config = FrontendConfig::new("127.0.0.1:0".parse().unwrap(), array);
    config.poll_timeout = Duration::from_millis(20);
    config.rpc_timeout_ticks = 500;
    config.degraded_writes = degraded_writes;
    FrontendServer::start(config).unwrap()
}

fn backend(index: usize, frontend: SocketAddr, dir: &Path) -> BackendServer {
    let mut config =
        BackendConfig::new(index, frontend, dir.join(format!("disk-{index}.img")), BLOCKS);
    config.block_size = BLOCK_SIZE;
    config.poll_timeout = Duration::from_millis(20);
    config.retry = Duration::from_millis(50);
    BackendServer::start(config).unwrap()
}

fn wait_for(server: &FrontendServer, what: &str, cond: impl Fn(&[DiskSnapshot]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let disks = server.status().unwrap();
        if cond(&disks) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}: {disks:?}");
        thread::sleep(Duration::from_millis(20));
    }
}

fn all_online(disks: &[DiskSnapshot]) -> bool {
    disks.iter().all(|disk| disk.connected && disk.status == DiskStatus::Online && disk.dirty == 0)
}

fn pattern(block: u64, round: u8) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| (i as u8).wrapping_mul(7) ^ (block as u8) ^ round).collect()
}

fn client(server: &FrontendServer) -> Client {
    let client = Client::connect(server.local_addr().unwrap()).unwrap();
    client.set_timeout(Some(Duration::from_secs(10))).unwrap();
    client
}

#[test]
fn survives_losing_and_rebuilding_disks() {
    let dir = tempfile::tempdir().unwrap();
    let server = frontend(DegradedWrite::Reconstruct);
    let addr = server.local_addr().unwrap();
    let mut backends =
        (0..=DATA_DISKS).map(|i| Some(backend(i, addr, dir.path()))).collect::<Vec<_>>();
    wait_for(&server, "all disks to log in", all_online);

    let capacity = DATA_DISKS as u64 * BLOCKS;
    let mut client = client(&server);
    client.init(true).unwrap();
    for block in 0..capacity {
        client.write(block, &pattern(block, 0)).unwrap();
    }

    // Disk 1 goes away: its blocks are reconstructed from the rest of their stripes
    backends[1].take().unwrap().stop().unwrap();
    wait_for(&server, "disk 1 to go offline", |disks| disks[1].status == DiskStatus::Offline);
    for block in 0..capacity {
        assert_eq!(client.read(block).unwrap(), pattern(block, 0), "block {block}");
    }

    // Writes while degraded land on the survivors and are rebuilt onto disk 1 later
    for block in 0..capacity {
        client.write(block, &pattern(block, 1)).unwrap();
    }
    backends[1] = Some(backend(1, addr, dir.path()));
    wait_for(&server, "disk 1 to be rebuilt", all_online);

    // The rebuilt disk now stands in for another one
    backends[2].take().unwrap().stop().unwrap();
    wait_for(&server, "disk 2 to go offline", |disks| disks[2].status == DiskStatus::Offline);
    for block in 0..capacity {
        assert_eq!(client.read(block).unwrap(), pattern(block, 1), "block {block}");
    }

    // No second failure is tolerated
    backends[3].take().unwrap().stop().unwrap();
    wait_for(&server, "disk 3 to go offline", |disks| disks[3].status == DiskStatus::Offline);
    let refused = (0..capacity).any(|block| {
        matches!(client.read(block), Err(ClientError::Service(ServiceError::DiskRefused(_))))
    });
    assert!(refused);

    client.disconnect().unwrap();
    for backend in backends.into_iter().flatten() {
        backend.stop().unwrap();
    }
    server.stop().unwrap();
}

#[test]
fn sessions_and_console_requests() {
    let dir = tempfile::tempdir().unwrap();
    let server = frontend(DegradedWrite::Refuse);
    let addr = server.local_addr().unwrap();
    let backends = (0..=DATA_DISKS).map(|i| backend(i, addr, dir.path())).collect::<Vec<_>>();
    wait_for(&server, "all disks to log in", all_online);

    // Nothing but CONNECT is served before the session is open
    let mut idle = Client::open(addr).unwrap();
    idle.set_timeout(Some(Duration::from_secs(10))).unwrap();
    assert!(matches!(
        idle.mul(6, 7),
        Err(ClientError::Service(ServiceError::InvalidArguments(_)))
    ));

    let mut client = client(&server);
    assert!(matches!(
        client.read(0),
        Err(ClientError::Service(ServiceError::InvalidArguments(_)))
    ));
    client.init(true).unwrap();

    assert_eq!(client.mul(6, -7).unwrap(), -42);
    let now = client.time().unwrap();
    assert!(now > 1_600_000_000);

    let table = client.display_disks().unwrap();
    let lines = table.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), DATA_DISKS + 1);
    assert_eq!(lines[0], "0 disk-0 online 0 0");

    client.write(4, b"short").unwrap();
    let block = client.read(4).unwrap();
    assert_eq!(&block[..5], b"short");
    assert!(block[5..].iter().all(|b| *b == 0));
    assert!(matches!(
        client.read(DATA_DISKS as u64 * BLOCKS),
        Err(ClientError::Service(ServiceError::InvalidArguments(_)))
    ));

    // Taking a disk offline by hand keeps its connection, so it can be rebuilt in place
    client.management(0, Management::Offline).unwrap();
    let disks = server.status().unwrap();
    assert_eq!(disks[0].status, DiskStatus::Offline);
    assert!(disks[0].connected);
    assert_eq!(client.read(4).unwrap()[..5], *b"short");
    assert!(matches!(
        client.management(1, Management::Offline),
        Err(ClientError::Service(ServiceError::DiskRefused(_)))
    ));
    client.management(0, Management::Rebuild).unwrap();
    wait_for(&server, "disk 0 to be rebuilt", all_online);

    client.disconnect().unwrap();
    for backend in backends {
        backend.stop().unwrap();
    }
    server.stop().unwrap();
}

//! Test cases for the process-wide handle count.
//!
//! Kept in its own test binary, so no other test opens handles while the count is checked.

use rstest::*;

use instrumentlink::{DeviceHandle, LoopbackDevice, Script, TcpServer, TcpServerConfig, runtime};

/// Opening registers a handle, closing or dropping releases it, and a second close changes nothing.
#[rstest]
fn open_handles_follow_close() {
    let before = runtime().open_handles();

    let mut dev = LoopbackDevice::open("count", Script::stream()).unwrap();
    assert_eq!(runtime().open_handles(), before + 1);
    let server = TcpServer::open("127.0.0.1:0", TcpServerConfig::default()).unwrap();
    assert_eq!(runtime().open_handles(), before + 2);

    dev.close();
    assert_eq!(runtime().open_handles(), before + 1);
    dev.close();
    assert_eq!(runtime().open_handles(), before + 1);

    drop(server);
    assert_eq!(runtime().open_handles(), before);
}

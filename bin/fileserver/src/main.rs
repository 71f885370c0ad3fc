use fileserver::Daemon;

const BINARY_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    xecute::DaemonProcess::start(BINARY_NAME, "MIFS File Server", VERSION, Daemon::new())
}

use crate::config::Config;
use crate::watch_list::WatchList;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The watch-list file changed on disk, e.g. after `add`/`remove` from another process.
    WatchListReloaded(WatchList),
    /// Ctrl+C received; the daemon should stop polling and exit.
    Shutdown,
}

//! Watches the directories given on the command line and prints every
//! change until interrupted.

#[cfg(windows)]
fn main() -> dirwatch::Result<()> {
    use dirwatch::{BitFlags, WatchService};

    env_logger::init();

    let dirs: Vec<String> = std::env::args().skip(1).collect();
    if dirs.is_empty() {
        eprintln!("usage: monitor <dir>...");
        std::process::exit(1);
    }

    let service = WatchService::new()?;
    let keys: Vec<_> = dirs
        .iter()
        .map(|dir| service.register(dir, BitFlags::all(), true))
        .collect::<dirwatch::Result<_>>()?;

    println!("watching {} directories", keys.len());
    loop {
        for key in &keys {
            while let Some(event) = key.poll() {
                match event.path {
                    Some(path) => println!("{:?} {}", event.kind, path.display()),
                    None => println!("{:?}", event.kind),
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

#[cfg(not(windows))]
fn main() {
    eprintln!("this example only runs on Windows");
}

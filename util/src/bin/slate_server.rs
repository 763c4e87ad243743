use basalt::logging;
use clap::{App, Arg};
use slate::{Instance, Value};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = App::new("slate-server")
        .about("Standalone coordination server publishing demo telemetry")
        .arg(
            Arg::with_name("address")
                .long("address")
                .takes_value(true)
                .default_value("0.0.0.0")
                .help("Address to listen on"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .default_value("1735")
                .help("Port to listen on"),
        )
        .arg(
            Arg::with_name("persist")
                .long("persist")
                .takes_value(true)
                .help("Persistent entry file"),
        )
        .get_matches();

    let log = logging::init();

    let address = matches.value_of("address").unwrap();
    let port: u16 = matches
        .value_of("port")
        .unwrap()
        .parse()
        .expect("invalid port");
    let persist = matches.value_of("persist").map(PathBuf::from);

    let instance = Instance::new(Some(&log));
    instance.set_identity("slate-server");
    instance.set_update_rate(0.05);
    instance
        .start_server(persist.as_deref(), address, port)
        .expect("failed to start server");

    let mut uptime = 0u64;
    loop {
        instance.set_entry_value("/server/uptime", Value::Double(uptime as f64));
        uptime += 1;
        thread::sleep(Duration::from_secs(1));
    }
}

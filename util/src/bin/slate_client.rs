use basalt::logging;
use clap::{App, Arg};
use slate::notifier::{
    EntryCallback, NOTIFY_DELETE, NOTIFY_FLAGS, NOTIFY_IMMEDIATE, NOTIFY_NEW, NOTIFY_UPDATE,
};
use slate::{Instance, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    let matches = App::new("slate-client")
        .about("Connects to a coordination server and prints entry changes")
        .arg(
            Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .default_value("127.0.0.1")
                .help("Server host"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .default_value("1735")
                .help("Server port"),
        )
        .get_matches();

    let log = logging::init();

    let host = matches.value_of("host").unwrap().to_owned();
    let port: u16 = matches
        .value_of("port")
        .unwrap()
        .parse()
        .expect("invalid port");

    let instance = Instance::new(Some(&log));
    instance.set_identity("slate-client");
    instance.set_update_rate(0.05);

    let printer: Arc<EntryCallback> = Arc::new(|_uid, name, value, flags| {
        println!("{:#04x} {} = {:?}", flags, name, value);
    });
    instance.add_entry_listener(
        "",
        printer,
        NOTIFY_IMMEDIATE | NOTIFY_NEW | NOTIFY_UPDATE | NOTIFY_DELETE | NOTIFY_FLAGS,
    );

    instance
        .start_client(vec![(host, port)])
        .expect("failed to start client");

    let mut beats = 0u64;
    loop {
        instance.set_entry_value("/client/heartbeat", Value::Double(beats as f64));
        beats += 1;
        thread::sleep(Duration::from_secs(1));
    }
}

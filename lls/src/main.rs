//! The `lls` daemon: a thin binary wiring the `fsp` Socket Table actor to the `runtime` reactor,
//! parsing its [`config::Config`] from CLI arguments and running the daemon main loop (§2.1).

mod config;

use clap::Parser;
use fsp::notice::Notice;
use fsp::Fsp;
use log::info;
use stakker::{actor, ret_nop, ActorOwn};

use crate::config::Config;

fn main() {
	let config = Config::parse();
	runtime::logger::install(config.log_level.into());

	let mut stakker = runtime::init();
	let locals = config.bind_addresses();

	info!("binding Lower Interface on {locals:?}");

	let notice = stakker::Fwd::new(|notice: Notice| info!("notice: {notice:?}"));
	let fsp: ActorOwn<Fsp> = actor!(&mut stakker, Fsp::init(locals, config.alfid_pool_capacity, notice), ret_nop!());

	runtime::exec(&mut stakker, move || drop(fsp)).expect("daemon main loop failed");
}

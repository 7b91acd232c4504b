use std::io;
use std::time::SystemTime;

use anyhow::{Context, Result};

use ampr_ripd::cli::Cli;
use ampr_ripd::discover;
use ampr_ripd::listener::{FileListener, MulticastListener};
use ampr_ripd::logging;
use ampr_ripd::os::linux::LinuxOs;
use ampr_ripd::os::{Listener, OsAdapter};
use ampr_ripd::reconciler::Reconciler;

fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse_ordered();
    let config = cli.into_config().context("invalid configuration")?;

    let os = LinuxOs::new().context("failed to establish a netlink connection")?;

    let now = SystemTime::now();
    let mut graph = discover::discover(&os, &config.acceptance, config.create_rtable, now)
        .context("startup discovery failed")?;
    for ifnum in &config.static_ifnums {
        graph.ifnums.set(*ifnum);
    }

    if config.dump {
        dump(&graph);
        return Ok(());
    }

    if config.daemonize {
        daemonize().context("failed to daemonize")?;
    }

    install_signal_handlers();

    let mut reconciler = Reconciler::new(
        graph,
        config.acceptance,
        config.local_outer,
        config.local_inner,
        config.create_rtable,
        &os,
    );

    let mut listener: Box<dyn Listener> = match &config.replay_file {
        Some(path) => Box::new(FileListener::open(path, config.password).context("opening replay file")?),
        None => {
            let socket = os
                .open_listener(config.bind_rtable)
                .context("binding the RIP listener")?;
            Box::new(MulticastListener::new(socket, config.password))
        }
    };

    loop {
        match listener.next_batch() {
            Ok(Some(responses)) => {
                for resp in responses {
                    reconciler.handle_response(resp, SystemTime::now())?;
                }
                reconciler.sweep_expired(SystemTime::now())?;
            }
            Ok(None) => {
                tracing::info!("replay input exhausted, shutting down");
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("listener failed"),
        }

        if should_exit() {
            return Ok(());
        }
    }
}

fn dump(graph: &ampr_ripd::model::Graph) {
    for (prefix, len, tunnel) in graph.tunnels.iter() {
        let outer_remote = std::net::Ipv4Addr::from(prefix);
        println!(
            "tunnel {} outer_remote={outer_remote} inner_remote={} nref={}",
            tunnel.ifname,
            tunnel.inner_remote,
            tunnel.nref()
        );
        let _ = len;
    }
    for (prefix, len, route) in graph.routes.iter() {
        let net = std::net::Ipv4Addr::from(prefix);
        println!("route {net}/{len} via {}", route.gateway);
    }
}

/// Double-fork and detach from the controlling terminal, matching the
/// original's use of `daemon(3)`.
fn daemonize() -> io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
    }
    Ok(())
}

static TERMINATE: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn handle_terminate(_signum: libc::c_int) {
    TERMINATE.store(true, std::sync::atomic::Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_terminate as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_terminate as libc::sighandler_t);
    }
}

fn should_exit() -> bool {
    TERMINATE.load(std::sync::atomic::Ordering::SeqCst)
}

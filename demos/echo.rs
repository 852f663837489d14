use std::{
    io::{self, BufRead},
    time::{Duration, Instant},
};

use netpoll::{
    block_on,
    net::{create_listener, Network, Options},
    server::Server,
    Engine,
};

fn main() -> netpoll::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // First we need an engine, which owns the poller, its driver thread and the task pool.
    let engine = Engine::builder().name_prefix("echo-").create()?;

    let listener = create_listener(Network::Tcp, "[::]:9091")?;

    // Every accepted connection runs this hook as its own task, echoing back whatever it
    // receives until the peer goes away. The work guard keeps the connection from being closed
    // by a graceful shutdown halfway through a response.
    let options = Options::new()
        .read_timeout(Duration::from_secs(30))
        .on_connect(|conn| async move {
            println!("Got connection from: {:?}", conn.peer_addr());
            let mut buf = vec![0u8; 4096];
            loop {
                let read = match conn.recv(&mut buf).await {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(e) => {
                        println!("Failed to receive from client: {}", e);
                        break;
                    }
                };

                let _work = conn.begin_work();
                if let Err(e) = conn.send_all(&buf[..read]).await {
                    println!("Failed to respond to client: {}", e);
                    break;
                }
            }
        });

    let server = Server::new(&engine, listener, options, |err| {
        println!("Server stopped: {}", err);
    });
    server.run()?;

    println!(
        "Listening on: {}, press enter to shut down.",
        server.local_addr()?
    );
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    // Give open connections five seconds to finish what they are doing.
    match block_on(server.close(Instant::now() + Duration::from_secs(5))) {
        Ok(()) => println!("All connections drained."),
        Err(e) => println!("Shut down with connections still open: {}", e),
    }
    engine.shutdown()
}

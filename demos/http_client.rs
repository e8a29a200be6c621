use std::rc::Rc;

use anyhow::Error;
use tracing::{event, Level};
use wharf::{
    message::{Mailbox, Sender},
    Actor, Meta, World,
};
use wharf_http::{
    client::{self, ClientAction, ClientConfig, ClientEvent},
    ClientRequest,
};
use wharf_mio::Registry;

fn main() -> Result<(), Error> {
    devutils::init_logging("info");

    let mut world = World::default();
    let registry = Rc::new(Registry::new()?);

    let actor = Service::new(&mut world, registry.clone())?;
    world.insert("http-client", actor)?;

    wharf_mio::run_event_loop(&mut world, &registry)?;

    Ok(())
}

struct Service {
    events: Mailbox<ClientEvent>,
    actions: Sender<ClientAction>,
    remaining: usize,
}

impl Service {
    fn new(world: &mut World, registry: Rc<Registry>) -> Result<Self, Error> {
        let events = Mailbox::default();

        let addr = "127.0.0.1:1234".parse()?;
        let actions = client::connect(world, registry, addr, ClientConfig::default(), events.sender())?;

        // Pipeline both requests, responses arrive in order
        let paths = ["/?name=client", "/stream"];
        for path in paths {
            let mut request = ClientRequest::get(path);
            request.set("Host", "127.0.0.1");
            actions.send(ClientAction::Send(request))?;
        }

        Ok(Service {
            events,
            actions,
            remaining: paths.len(),
        })
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.events.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.events.recv() {
            match event {
                ClientEvent::Response(response) => {
                    event!(Level::INFO, status = response.status, "received response");
                    println!("{}", String::from_utf8_lossy(&response.body));

                    self.remaining -= 1;
                    if self.remaining == 0 {
                        // Closing the connection lets the event loop run out of actors
                        self.actions.send(ClientAction::Close)?;
                        meta.set_stop();
                    }
                }
                ClientEvent::ParseError(error) => {
                    event!(Level::WARN, code = error.code, reason = %error.reason, "bad response");
                    meta.set_stop();
                }
                ClientEvent::Closed => meta.set_stop(),
                ClientEvent::Upgraded { .. } | ClientEvent::UpgradeFailed(_) => {}
            }
        }

        Ok(())
    }
}

use std::rc::Rc;

use anyhow::Error;
use tracing::{event, Level};
use wharf::{message::Mailbox, Actor, Meta, World};
use wharf_http::server::{self, HttpEvent, RequestEvent, ServerConfig};
use wharf_mio::Registry;

fn main() -> Result<(), Error> {
    devutils::init_logging("info");

    let mut world = World::default();
    let registry = Rc::new(Registry::new()?);

    // Start the actor
    let actor = Service::new(&mut world, registry.clone())?;
    world.insert("http-hello", actor)?;

    // Run the event loop
    wharf_mio::run_event_loop(&mut world, &registry)?;

    Ok(())
}

struct Service {
    http_events: Mailbox<HttpEvent>,
}

impl Service {
    fn new(world: &mut World, registry: Rc<Registry>) -> Result<Self, Error> {
        let http_events = Mailbox::default();

        let addr = "127.0.0.1:1234".parse()?;
        let info = server::listen(
            world,
            registry,
            addr,
            ServerConfig::default(),
            http_events.sender(),
        )?;
        event!(Level::INFO, addr = ?info.local_addr, "listening");

        Ok(Service { http_events })
    }
}

impl Actor for Service {
    fn register(&mut self, _world: &mut World, meta: &mut Meta) -> Result<(), Error> {
        self.http_events.set_signal(meta.signal())?;
        Ok(())
    }

    fn process(&mut self, _world: &mut World, _meta: &mut Meta) -> Result<(), Error> {
        while let Some(event) = self.http_events.recv() {
            let HttpEvent::Request(event) = event;
            handle(event)?;
        }

        Ok(())
    }
}

fn handle(event: RequestEvent) -> Result<(), Error> {
    let RequestEvent {
        request,
        mut response,
    } = event;
    event!(Level::INFO, method = %request.method, path = %request.path, "request");

    match request.path.as_str() {
        "/" => {
            let name: String = request
                .query("name")
                .chars()
                .filter(|c| c.is_alphanumeric())
                .take(64)
                .collect();
            let name = if name.is_empty() { "World" } else { name.as_str() };

            let visits = request.cookie("visits").parse::<u32>().unwrap_or(0) + 1;
            response.cookie("visits", &visits.to_string(), Default::default());
            response.send_text(&format!(
                "<!DOCTYPE html><html><body><h1>Hello, {}!</h1><p>Visit {}</p></body></html>",
                name, visits
            ))?;
        }
        "/stream" => {
            response.content_type("text/plain");
            for line in ["one\n", "two\n", "three\n"] {
                response.write(line.as_bytes())?;
            }
            response.finish()?;
        }
        "/old" => response.redirect(301, "/")?,
        _ => response.send_status(404)?,
    }

    Ok(())
}

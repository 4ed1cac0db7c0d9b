use std::time::Duration;

use tiny_http::{Header, Method, Request, Response, Server};

/// `Last-Modified` header for all files.
pub const LAST_MODIFIED: &str = "Tue, 15 Nov 2014 08:12:31 GMT";

/// Entry in the image server.
pub enum Route {
    /// File served with `HEAD` and `GET`.
    ///
    /// Files must be small, so the server sends a `Content-Length` instead
    /// of a chunked body.
    File(&'static str, Vec<u8>),

    /// `301` response to the location.
    Redirect(&'static str, &'static str),
}

/// Start a web server with the images in `routes`, in a random port.
///
/// Returns the port number of the server.
pub fn start_image_server(routes: Vec<Route>) -> u16 {
    let server = Server::http("127.0.0.1:0").expect("start image server");
    let port = server.server_addr().to_ip().unwrap().port();

    let images = ImageServer { server, routes };

    std::thread::spawn(move || images.run());

    port
}

struct ImageServer {
    server: Server,
    routes: Vec<Route>,
}

impl ImageServer {
    fn run(self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&self, request: Request) {
        if !matches!(request.method(), Method::Head | Method::Get) {
            let _ = request.respond(Response::empty(405));
            return;
        }

        let route = self.routes.iter().find(|r| match r {
            Route::File(path, _) | Route::Redirect(path, _) => *path == request.url(),
        });

        let response = match route {
            Some(Route::File(_, data)) => Response::from_data(data.clone())
                .with_header(Header::from_bytes("Last-Modified", LAST_MODIFIED).unwrap()),

            Some(Route::Redirect(_, location)) => Response::from_data(vec![])
                .with_status_code(301)
                .with_header(Header::from_bytes("Location", *location).unwrap()),

            None => Response::from_string("Not Found").with_status_code(404),
        };

        request.respond(response).expect("Send response");
    }
}

//! Method handlers. This is the code that turns one parsed request into one
//! response: file reads for GET/HEAD, file writes for PUT, file removal for
//! DELETE, echoes for POST/TRACE, the capability listing for OPTIONS and the
//! capacity report for SERVERCHECK.
//!
//! Every response copies the request's `Source-IP`/`Source-Port` into
//! `Target-IP`/`Target-Port`; without that pair the balancer could not route
//! the response back to the right client.

use std::io;

use log::warn;

use crate::http::{frame_text, request::Request, response::Response, Method, Status, ALLOW};

/// Largest body served from a file. Leaves room for the start line and
/// header block inside the fixed-size frame.
pub const BODY_LIMIT: usize = 3000;

/// Produces the response for one request frame. Protocol errors become the
/// matching error responses; this function never fails.
pub async fn respond(frame: &[u8], max_load: usize) -> Response {
    let request = match Request::parse(frame) {
        Ok(request) => request,
        Err(err) => {
            warn!("rejecting request: {}", err.status);
            return Response::new(err.status, err.target_ip, err.target_port);
        }
    };

    let (target_ip, target_port) = request.routing_pair();

    match request.method {
        Method::Get => get(&request.url, target_ip, target_port).await,
        Method::Head => head(&request.url, target_ip, target_port).await,
        Method::Put => put(&request.url, &request.body, target_ip, target_port).await,
        Method::Post => post(&request.body, target_ip, target_port),
        Method::Trace => trace(frame, target_ip, target_port),
        Method::Options => options(target_ip, target_port),
        Method::Delete => delete(&request.url, target_ip, target_port).await,
        Method::ServerCheck => server_check(max_load, target_ip, target_port),
    }
}

async fn get(url: &str, target_ip: String, target_port: String) -> Response {
    match read_bounded(url).await {
        Ok(contents) => Response::new(Status::Ok, target_ip, target_port).with_body(contents),
        Err(err) => Response::new(file_error_status(&err), target_ip, target_port),
    }
}

/// Same as GET except the body is not sent; the content headers still
/// describe it.
async fn head(url: &str, target_ip: String, target_port: String) -> Response {
    let mut response = get(url, target_ip, target_port).await;
    response.body.clear();
    response
}

async fn put(url: &str, body: &str, target_ip: String, target_port: String) -> Response {
    match tokio::fs::write(url, body).await {
        Ok(()) => {
            let mut response =
                Response::new(Status::Created, target_ip, target_port).with_body(url);
            response.location = Some(url.to_string());
            response
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Response::new(Status::Unauthorized, target_ip, target_port)
        }
        Err(_) => Response::new(Status::InternalServerError, target_ip, target_port),
    }
}

fn post(body: &str, target_ip: String, target_port: String) -> Response {
    Response::new(Status::Ok, target_ip, target_port).with_body(format!("{body} is in stock"))
}

/// Echoes the request back, whole.
fn trace(frame: &[u8], target_ip: String, target_port: String) -> Response {
    let echoed = String::from_utf8_lossy(frame_text(frame)).into_owned();
    Response::new(Status::Ok, target_ip, target_port).with_body(echoed)
}

fn options(target_ip: String, target_port: String) -> Response {
    let mut response = Response::new(Status::Ok, target_ip, target_port);
    response.allow = Some(String::from(ALLOW));
    response.content_length = Some(String::from("0"));
    response
}

async fn delete(url: &str, target_ip: String, target_port: String) -> Response {
    match tokio::fs::remove_file(url).await {
        Ok(()) => {
            Response::new(Status::Ok, target_ip, target_port).with_body("File is deleted.")
        }
        Err(err) => {
            let status = if err.raw_os_error() == Some(libc::ENAMETOOLONG) {
                Status::UrlTooLong
            } else {
                file_error_status(&err)
            };
            Response::new(status, target_ip, target_port)
        }
    }
}

fn server_check(max_load: usize, target_ip: String, target_port: String) -> Response {
    Response::new(Status::Ok, target_ip, target_port).with_body(max_load.to_string())
}

/// Reads at most [`BODY_LIMIT`] bytes of the file at `url`.
async fn read_bounded(url: &str) -> io::Result<String> {
    let bytes = tokio::fs::read(url).await?;
    let end = bytes.len().min(BODY_LIMIT);

    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn file_error_status(err: &io::Error) -> Status {
    match err.kind() {
        io::ErrorKind::NotFound => Status::NotFound,
        io::ErrorKind::PermissionDenied => Status::Unauthorized,
        _ => Status::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn scratch(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("rlb-service-{}-{name}", std::process::id()))
            .display()
            .to_string()
    }

    fn request(method: Method, url: &str) -> Request {
        let mut request = Request::new(method, url).source("127.0.0.1", "49152");
        request.host = Some(String::from("localhost"));
        request
    }

    #[tokio::test]
    async fn get_serves_file_contents_with_routing_headers() {
        let path = scratch("get.txt");
        std::fs::write(&path, "message to get").unwrap();

        let response = respond(&request(Method::Get, &path).encode(), 10).await;

        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, "message to get");
        assert_eq!(response.content_length.as_deref(), Some("14"));
        assert_eq!(response.target_ip, "127.0.0.1");
        assert_eq!(response.target_port, "49152");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn get_missing_file_is_404() {
        let response = respond(&request(Method::Get, "./does-not-exist.txt").encode(), 10).await;
        assert_eq!(response.status, Status::NotFound);
    }

    #[tokio::test]
    async fn head_describes_the_body_without_sending_it() {
        let path = scratch("head.txt");
        std::fs::write(&path, "message to get").unwrap();

        let response = respond(&request(Method::Head, &path).encode(), 10).await;

        assert_eq!(response.status, Status::Ok);
        assert!(response.body.is_empty());
        assert_eq!(response.content_length.as_deref(), Some("14"));

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn put_writes_the_body_and_reports_created() {
        let path = scratch("put.txt");
        let mut req = request(Method::Put, &path);
        req.content_type = Some(String::from("text/plain"));
        req.content_length = Some(String::from("14"));
        req.body = String::from("I'm a message.");

        let response = respond(&req.encode(), 10).await;

        assert_eq!(response.status, Status::Created);
        assert_eq!(response.location.as_deref(), Some(path.as_str()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "I'm a message.");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn post_echoes_with_the_stock_suffix() {
        let mut req = request(Method::Post, "./form");
        req.accept = None;
        req.content_type = Some(String::from("text/plain"));
        req.body = String::from("color=red");

        let response = respond(&req.encode(), 10).await;

        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, "color=red is in stock");
    }

    #[tokio::test]
    async fn trace_echoes_the_whole_request() {
        let mut req = request(Method::Trace, "./anything");
        req.accept = Some(String::from("*"));
        let frame = req.encode();

        let response = respond(&frame, 10).await;

        assert_eq!(response.status, Status::Ok);
        assert!(response.body.starts_with("TRACE ./anything HTTP/1.1"));
        assert!(response.body.contains("Source-IP: 127.0.0.1"));
    }

    #[tokio::test]
    async fn options_lists_the_public_methods_only() {
        let response = respond(&request(Method::Options, "*").encode(), 10).await;

        assert_eq!(response.status, Status::Ok);
        assert_eq!(
            response.allow.as_deref(),
            Some("GET, HEAD, PUT, POST, TRACE, OPTIONS, DELETE")
        );
        assert!(!response.allow.unwrap().contains("SERVERCHECK"));
    }

    #[tokio::test]
    async fn delete_removes_the_file_then_cannot_find_it() {
        let path = scratch("delete.txt");
        std::fs::write(&path, "bye").unwrap();

        let mut req = request(Method::Delete, &path);
        req.accept = None;

        let first = respond(&req.encode(), 10).await;
        assert_eq!(first.status, Status::Ok);
        assert_eq!(first.body, "File is deleted.");
        assert!(!std::path::Path::new(&path).exists());

        let second = respond(&req.encode(), 10).await;
        assert_eq!(second.status, Status::NotFound);
    }

    #[tokio::test]
    async fn servercheck_reports_the_advertised_capacity() {
        let mut req = request(Method::ServerCheck, "127.0.0.2");
        req.accept = None;

        let response = respond(&req.encode(), 12).await;

        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.body, "12");
    }

    #[tokio::test]
    async fn protocol_errors_become_error_responses() {
        let wrong_version =
            b"GET ./x HTTP/1.0\r\nSource-IP: 127.0.0.1\r\nSource-Port: 7\r\n\r\n";
        let unknown_method = b"PATCH ./x HTTP/1.1\r\n\r\n";
        let unknown_header = b"GET ./x HTTP/1.1\r\nX-Weird: yes\r\n\r\n";

        assert_eq!(
            respond(wrong_version, 10).await.status,
            Status::VersionNotSupported
        );
        assert_eq!(
            respond(unknown_method, 10).await.status,
            Status::MethodNotAllowed
        );
        assert_eq!(respond(unknown_header, 10).await.status, Status::BadRequest);

        // Routing still works on the error path.
        let response = respond(wrong_version, 10).await;
        assert_eq!(response.target_ip, "127.0.0.1");
        assert_eq!(response.target_port, "7");
    }
}

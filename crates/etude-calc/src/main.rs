// src/main.rs
//! `calc_cgi`: adds the two integers of a `a=1&b=2` form body.
//!
//! Reads `METHOD` and `CONTENT_LENGTH` from the environment and the body from
//! stdin, then prints a complete HTTP/1.1 response on stdout.

use std::env;
use std::io::{self, Read, Write};

const MAX_BODY: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
struct Sum {
    lhs: i64,
    rhs: i64,
}

impl Sum {
    fn total(&self) -> Option<i64> {
        self.lhs.checked_add(self.rhs)
    }
}

/// Parse `name=value&name=value`; both values must be integers.
fn parse_form(body: &str) -> Option<Sum> {
    let mut values = body.trim_end().split('&').map(|pair| {
        let (_, value) = pair.split_once('=')?;
        value.trim().parse::<i64>().ok()
    });
    let lhs = values.next()??;
    let rhs = values.next()??;
    if values.next().is_some() {
        return None;
    }
    Some(Sum { lhs, rhs })
}

fn read_body(len: usize) -> io::Result<String> {
    let mut body = Vec::with_capacity(len);
    io::stdin().take(len as u64).read_to_end(&mut body)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn render(status: &str, html: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nServer: etude calc_cgi\r\nConnection: close\r\nContent-Length: {}\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{}",
        status,
        html.len(),
        html
    )
}

fn respond(method: Option<&str>, content_length: Option<&str>, body: impl FnOnce(usize) -> io::Result<String>) -> io::Result<String> {
    let bad = || render("400 Bad Request", "<html><body><h1>Bad Request</h1></body></html>");

    if !method.is_some_and(|m| m.eq_ignore_ascii_case("POST")) {
        return Ok(bad());
    }
    let Some(len) = content_length.and_then(|v| v.trim().parse::<usize>().ok()) else {
        return Ok(bad());
    };
    let body = body(len.min(MAX_BODY))?;

    let Some(sum) = parse_form(&body) else {
        return Ok(bad());
    };
    let Some(total) = sum.total() else {
        return Ok(bad());
    };
    let html = format!(
        "<html><body><h1>{} + {} = {}</h1></body></html>",
        sum.lhs, sum.rhs, total
    );
    Ok(render("200 OK", &html))
}

fn main() -> io::Result<()> {
    let method = env::var("METHOD").ok();
    let content_length = env::var("CONTENT_LENGTH").ok();
    let response = respond(method.as_deref(), content_length.as_deref(), read_body)?;

    let mut out = io::stdout().lock();
    out.write_all(response.as_bytes())?;
    out.flush()
}

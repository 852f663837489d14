use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Future;

use crate::Result;

use super::Connection;

/// This represents a single use asynchronous receive on a [Connection], it copies buffered data
/// into the given buffer and resolves to the number of bytes copied, waiting for the reader if
/// nothing is buffered yet.
pub struct Recv<'a> {
    conn: &'a Connection,
    buf: &'a mut [u8],
}

impl<'a> Recv<'a> {
    pub(crate) fn new(conn: &'a Connection, buf: &'a mut [u8]) -> Recv<'a> {
        Recv { conn, buf }
    }
}

impl<'a> Future for Recv<'a> {
    type Output = Result<usize>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        this.conn.poll_recv(cx, this.buf)
    }
}

/// This represents a single use asynchronous send on a [Connection], it resolves to the number of
/// bytes written from the buffer once the socket accepts any of it.
pub struct Send<'a> {
    conn: &'a Connection,
    buf: &'a [u8],
}

impl<'a> Send<'a> {
    pub(crate) fn new(conn: &'a Connection, buf: &'a [u8]) -> Send<'a> {
        Send { conn, buf }
    }
}

impl<'a> Future for Send<'a> {
    type Output = Result<usize>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.conn.poll_send(cx, self.buf)
    }
}

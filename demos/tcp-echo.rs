// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TCP echo server on a TAP device.
//!
//! Bring up the interface first:
//!
//! ```sh
//! ip tuntap add mode tap tap0
//! ip addr add 192.168.1.100/24 dev tap0
//! ip link set tap0 up
//! ```
//!
//! then `nc 192.168.1.1 30000` from the same host echoes lines back.

use ::std::net::Ipv4Addr;
use ::tapstack::{
    runtime::macaddr::MacAddress,
    TapStack,
};

const IFACE: &str = "tap0";
const LOCAL_MAC: MacAddress = MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const ECHO_PORT: u16 = 30000;

fn main() {
    let stack: TapStack = match TapStack::new(IFACE, LOCAL_MAC, LOCAL_IP) {
        Ok(stack) => stack,
        Err(e) => {
            eprintln!("cannot bring up {}: {} (are you root?)", IFACE, e);
            ::std::process::exit(1);
        },
    };

    let listen_fd: i32 = stack
        .socket(libc::IPPROTO_TCP, LOCAL_IP, ECHO_PORT)
        .expect("socket allocation cannot fail on a fresh stack");
    stack.listen(listen_fd).expect("echo port is not in use");

    let accept_stack: TapStack = stack.clone();
    stack.register_accept_callback(listen_fd, move || {
        // Accept everything that finished its handshake this tick.
        while let Ok(fd) = accept_stack.accept(listen_fd) {
            println!("accepted connection (socket {})", fd);
            let read_stack: TapStack = accept_stack.clone();
            accept_stack.register_read_callback(fd, move || {
                let mut buf: [u8; 2048] = [0; 2048];
                loop {
                    match read_stack.read(fd, &mut buf) {
                        // End of stream: echo back our own goodbye.
                        Ok(0) => {
                            println!("connection closed (socket {})", fd);
                            let _ = read_stack.close(fd);
                            break;
                        },
                        Ok(len) => {
                            if read_stack.write(fd, &buf[..len]).is_err() {
                                let _ = read_stack.close(fd);
                                break;
                            }
                        },
                        // Drained this tick's data.
                        Err(_) => break,
                    }
                }
            });
        }
    });

    println!("echo server on {}:{}", LOCAL_IP, ECHO_PORT);
    stack.run();
}

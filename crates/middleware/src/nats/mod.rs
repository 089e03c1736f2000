mod transport;

pub use transport::NatsTransport;

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not prepare the data directory")]
    DataDirectory,
    #[display("mirroring service failed")]
    Service,
    #[display("command failed")]
    Command,
}

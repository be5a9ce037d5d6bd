/// Types implementing WireSerialisable can be written to a front end
/// connection, in either direction.
pub trait WireSerialisable {
    /// Converts the value in question to its CRLF-terminated wire form.
    fn serialise_wire(&self) -> Vec<u8>;
}

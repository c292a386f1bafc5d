/// Engine configuration.
#[derive(Clone, Debug)]
pub struct AittOption {
    /// Address advertised to remote peers for direct channels. Must be
    /// reachable from the LAN; the loopback default only serves local tests.
    pub my_ip: String,

    /// Ask the broker to discard session state between connections.
    pub clean_session: bool,

    /// The application operates its own broker deployment; the engine keeps
    /// its hands off broker-side provisioning and simply connects to the
    /// host it is given.
    pub custom_broker: bool,
}

impl Default for AittOption {
    fn default() -> AittOption {
        AittOption {
            my_ip: "127.0.0.1".to_owned(),
            clean_session: false,
            custom_broker: false,
        }
    }
}

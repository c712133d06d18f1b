use clap::Parser;

/// Chat coordination server hosting the agent, heartbeat, and lobby
/// services in one process.
#[derive(Debug, Parser)]
#[command(name = "server")]
pub struct ServerArgs {
    /// Agent listen address.
    #[arg(long, default_value = "localhost:50050")]
    pub agent: String,

    /// Heartbeat listen address.
    #[arg(long, default_value = "localhost:50051")]
    pub heartbeat: String,

    /// Lobby listen address.
    #[arg(long, default_value = "localhost:50052")]
    pub lobby: String,

    /// IP that dynamically created channels bind to.
    #[arg(long = "channel-ip", default_value = "localhost")]
    pub channel_ip: String,

    /// Ports available for channels, allocated front first.
    #[arg(
        long,
        num_args = 1..,
        value_delimiter = ' ',
        default_values_t = [50054u16, 50055, 50056, 50057],
    )]
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_addresses() {
        let args = ServerArgs::parse_from(["server"]);

        assert_eq!(args.agent, "localhost:50050");
        assert_eq!(args.heartbeat, "localhost:50051");
        assert_eq!(args.lobby, "localhost:50052");
        assert_eq!(args.channel_ip, "localhost");
        assert_eq!(args.ports, vec![50054, 50055, 50056, 50057]);
    }

    #[test]
    fn ports_accept_a_space_separated_list() {
        let args = ServerArgs::parse_from(["server", "--ports", "51000 51001"]);

        assert_eq!(args.ports, vec![51000, 51001]);
    }
}

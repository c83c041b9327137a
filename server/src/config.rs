use clap::Parser;

/// Server configuration, parsed from the command line.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Authoritative room relay server")]
pub struct ServerConfig {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[clap(short, long, default_value_t = 1337)]
    pub port: u16,

    /// Maximum number of simultaneous players
    #[clap(long, default_value_t = 10)]
    pub max_players: usize,

    /// Highest valid room identifier (rooms are 0..=max_room_id)
    #[clap(long, default_value_t = 335)]
    pub max_room_id: i16,

    /// Minimum milliseconds between room changes per player
    #[clap(long, default_value_t = 200)]
    pub room_change_cooldown_ms: i64,

    /// Maximum allowed movement per frame, in pixels
    #[clap(long, default_value_t = 6.0)]
    pub speed_limit: f32,

    /// Kick players on implausible movement instead of teleporting them back
    #[clap(long)]
    pub kick_bad_movement: bool,

    /// Allow at most one active session per source IP address
    #[clap(long)]
    pub disallow_same_ip: bool,

    /// Bypass the sprite/frame allow-list checks (for testing clients)
    #[clap(long)]
    pub testing_mode: bool,

    /// Milliseconds without a packet before a session or connection is evicted
    #[clap(long, default_value_t = 4000)]
    pub idle_timeout_ms: i64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Number of room occupant lists, including room 0.
    pub fn room_count(&self) -> usize {
        self.max_room_id as usize + 1
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 1337,
            max_players: 10,
            max_room_id: 335,
            room_change_cooldown_ms: 200,
            speed_limit: 6.0,
            kick_bad_movement: false,
            disallow_same_ip: false,
            testing_mode: false,
            idle_timeout_ms: 4000,
        }
    }
}

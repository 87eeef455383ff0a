use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use framecast::{
    AuthScheme, Credentials, FrameData, PixelFormat, ServerConfig, StreamServer, VideoFrame,
};

#[derive(Parser)]
#[command(
    name = "framecast-server",
    about = "Standalone RTSP server streaming a synthetic H.264 test pattern"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Stream width in pixels
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Stream height in pixels
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Frame rate in Hz
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Target bit rate in kilobits per second
    #[arg(long, default_value_t = 2500)]
    bitrate: u32,

    /// Require this username (with --password) from clients
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Password for --username
    #[arg(long, requires = "username")]
    password: Option<String>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let credentials = match (&args.username, &args.password) {
        (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
        _ => None,
    };

    let config = ServerConfig {
        credentials,
        auth_scheme: AuthScheme::Digest,
        sdp_session_name: "framecast test pattern".to_string(),
        ..ServerConfig::default()
    };

    let mut server = StreamServer::new(config);
    if let Err(e) = server.start(&args.bind) {
        eprintln!("Failed to start server: {}", e);
        return;
    }

    println!(
        "Streaming rtsp://{} at {}x{}@{} — press Enter to stop",
        args.bind, args.width, args.height, args.fps
    );

    let stopping = Arc::new(AtomicBool::new(false));
    let stdin_flag = stopping.clone();
    thread::spawn(move || {
        let mut input = String::new();
        let _ = io::stdin().read_line(&mut input);
        stdin_flag.store(true, Ordering::SeqCst);
    });

    run_test_pattern(&server, &args, &stopping);

    server.stop();
}

/// Feed the server a moving gradient at the requested frame rate until
/// the stop flag is set.
fn run_test_pattern(server: &StreamServer, args: &Args, stopping: &AtomicBool) {
    let frame_interval = Duration::from_secs(1) / args.fps.max(1);
    let mut buffer = vec![0u8; PixelFormat::I420.buffer_size(args.width, args.height)];
    let started = Instant::now();
    let mut frame_index = 0u64;

    while !stopping.load(Ordering::SeqCst) {
        fill_test_pattern(&mut buffer, args.width, args.height, frame_index);

        server.enqueue_frame(
            VideoFrame {
                width: args.width,
                height: args.height,
                format: PixelFormat::I420,
                timestamp_ns: started.elapsed().as_nanos() as u64,
                data: FrameData::Cpu(&buffer),
            },
            args.fps,
            args.bitrate,
        );

        frame_index += 1;
        thread::sleep(frame_interval);
    }
}

/// Moving diagonal gradient with slowly cycling chroma, in I420 layout.
fn fill_test_pattern(buffer: &mut [u8], width: u32, height: u32, frame_index: u64) {
    let (width, height) = (width as usize, height as usize);
    let t = (frame_index * 2) as usize;

    let (y_plane, chroma) = buffer.split_at_mut(width * height);
    for row in 0..height {
        for col in 0..width {
            y_plane[row * width + col] = ((col + row + t) & 0xff) as u8;
        }
    }

    let (u_plane, v_plane) = chroma.split_at_mut(width * height / 4);
    let u = ((t / 4) & 0xff) as u8;
    let v = 255 - u;
    u_plane.fill(u);
    v_plane.fill(v);
}

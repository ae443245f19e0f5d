use anyhow::anyhow;
use clap::Parser;
use const_format::concatcp;
use rand::seq::SliceRandom;
use regex::bytes::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::ops::{AddAssign, Div};
use std::process::{self, Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const LOCAL_PORT: u32 = 8374;
const LOCAL_URL: &str = concatcp!("http://127.0.0.1:", LOCAL_PORT);

/// Settlement delay used by the local server, kept short so the benchmark
/// measures the server rather than the simulated payment.
const LOCAL_PAYMENT_DELAY_MS: u32 = 50;

#[rustfmt::skip]
const ROCKET_ENV: &[(&str, &str)] = &[
    ("ROCKET_PORT", concatcp!(LOCAL_PORT)),
    ("ROCKET_PAYMENT_DELAY_MS", concatcp!(LOCAL_PAYMENT_DELAY_MS)),
];

#[rustfmt::skip]
const CHOICES: &[&str] = &[
    "Alice",
    "Bob",
    "Carol",
    "Dave",
    "Eve",
];

#[derive(Parser)]
struct Args {
    /// Silence local server logging.
    #[arg(short, long)]
    quiet: bool,

    /// Send local server logging to this file; takes precedence over --quiet.
    #[arg(long)]
    logfile: Option<String>,

    /// Suppress test-setup.sh output and always re-use any existing DB.
    #[arg(long)]
    reuse_db: bool,

    /// Connect to a remote server at this URL instead of running a local one.
    #[arg(long)]
    remote: Option<String>,

    /// How many threads to use. Defaults to the number of logical CPUs.
    #[arg(long, default_value_t = num_cpus::get())]
    threads: usize,

    /// Participants per thread.
    #[arg(long, default_value_t = 100)]
    iterations: usize,

    /// Also fire a simultaneous duplicate vote for every participant, and
    /// check that exactly one of each pair is accepted.
    #[arg(long)]
    double_vote: bool,
}

/// Construct a URL from segments.
macro_rules! url {
    ($($segment:expr),+) => {{
        std::path::PathBuf::from_iter([$($segment),+]).to_str().unwrap()
    }}
}

/// Set up everything we need before starting the server.
fn setup_deps(always_reuse: bool) -> anyhow::Result<()> {
    // Ensure the optimised build is up-to-date.
    Command::new("cargo")
        .args(["build", "--release"])
        .status()?
        .success()
        .then_some(())
        .ok_or_else(|| anyhow!("server build exited nonzero"))?;

    // Ensure the DB is running and set its URI in the environment.
    let stdin = if always_reuse {
        Stdio::piped()
    } else {
        Stdio::inherit()
    };
    let mut test_setup = Command::new("./test-setup.sh")
        .stdin(stdin)
        .stdout(Stdio::piped())
        .spawn()?;

    if let Some(mut proc_stdin) = test_setup.stdin.take() {
        // Send an 'r' to trigger DB reuse.
        proc_stdin.write_all(b"r\n")?;
    }

    // Bounce to our stdout while scanning for the DB URI.
    let mut proc_stdout = test_setup
        .stdout
        .take()
        .ok_or_else(|| anyhow!("test-setup stdout unavailable"))?;
    let mut buf = [0u8; 128];

    let mut stdout = io::stdout();

    let mut found = false;
    let mut line = Vec::<u8>::with_capacity(256);
    let pattern = Regex::new(r"'export ROCKET_DB_URI=(.+)'")?;

    loop {
        // Read a chunk of output.
        let n = match proc_stdout.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                } else {
                    return Err(e.into());
                }
            }
        };
        if n == 0 {
            // Pipe closed.
            break;
        }

        if !always_reuse {
            // Bounce it to stdout.
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        }

        // Look for the DB URI. We use a separate line buffer to avoid missing the match in the
        // case where it lies across a read() boundary.
        if !found {
            // Clear previous lines out of the line buffer.
            if let Some(i) = line.iter().rposition(|b| *b == b'\n') {
                line.drain(..=i);
            }

            // Add this blob to the line buffer.
            line.extend_from_slice(&buf[..n]);

            // Look in the line buffer for a match.
            if let Some(caps) = pattern.captures(&line) {
                let val = std::str::from_utf8(&caps[1])?;
                env::set_var("ROCKET_DB_URI", val);
                found = true;
            }
        }
    }

    test_setup
        .wait()?
        .success()
        .then_some(())
        .ok_or_else(|| anyhow!("test-setup returned nonzero"))?;

    if !found {
        return Err(anyhow!("didn't see ROCKET_DB_URI in test-setup output"));
    }

    // Set other environment variables.
    for (var, val) in ROCKET_ENV {
        env::set_var(var, val);
    }

    Ok(())
}

/// Terminate the given child process. This is a SIGTERM on unix and a hard-kill on other
/// platforms.
fn terminate_child(child: &mut Child) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM)?;
    }
    #[cfg(not(unix))]
    {
        child.kill()?;
    }
    Ok(())
}

/// Start the local server and wait until it answers.
fn launch_server(logfile: Stdio) -> anyhow::Result<Child> {
    let mut proc = Command::new("./target/release/paidvote-backend")
        .stdout(logfile)
        .spawn()?;

    // Wait for the server to be reachable.
    let client = Client::new();
    loop {
        let resp = client
            .get(url!(LOCAL_URL, "api/results"))
            .send()
            .and_then(Response::error_for_status);

        if resp.is_ok() {
            break;
        }

        // Check the server didn't exit.
        if let Some(retcode) = proc.try_wait()? {
            return Err(anyhow!("Server exited prematurely with code {}", retcode));
        }
        thread::sleep(Duration::from_millis(100));
    }

    Ok(proc)
}

#[derive(Deserialize)]
struct Status {
    paid: bool,
    voted: bool,
}

/// A fresh identity for each participant, unique across runs.
fn identity(run: u32, participant: usize) -> String {
    format!("bench-{run:08x}-{participant:06}")
}

/// Durations of each part of the voting process.
#[derive(Debug, Default)]
struct VoteTimings {
    register: Duration,
    payment: Duration,
    settle: Duration,
    vote: Duration,
}

impl AddAssign for VoteTimings {
    fn add_assign(&mut self, rhs: Self) {
        self.register += rhs.register;
        self.payment += rhs.payment;
        self.settle += rhs.settle;
        self.vote += rhs.vote;
    }
}

impl Div<u32> for VoteTimings {
    type Output = Self;

    fn div(self, rhs: u32) -> Self {
        Self {
            register: self.register / rhs,
            payment: self.payment / rhs,
            settle: self.settle / rhs,
            vote: self.vote / rhs,
        }
    }
}

/// Take one participant from registration to a recorded vote.
/// Returns the timings and the first-round choice that was recorded.
fn participate(
    url: &str,
    client: &Client,
    identity: &str,
    double_vote: bool,
) -> anyhow::Result<(VoteTimings, &'static str)> {
    let body = json!({ "identity": identity });

    // Register.
    let pre_register = Instant::now();
    client
        .post(url!(url, "api/register"))
        .json(&body)
        .send()
        .and_then(Response::error_for_status)?;
    let post_register = Instant::now();

    // Pay.
    client
        .post(url!(url, "api/payment"))
        .json(&body)
        .send()
        .and_then(Response::error_for_status)?;
    let post_payment = Instant::now();

    // Poll until the payment settles.
    loop {
        let status: Status = client
            .post(url!(url, "api/status"))
            .json(&body)
            .send()
            .and_then(Response::error_for_status)?
            .json()?;
        if status.voted {
            return Err(anyhow!("{identity} voted before casting a vote"));
        }
        if status.paid {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let post_settle = Instant::now();

    // Vote.
    let mut rng = rand::thread_rng();
    let first = *CHOICES.choose(&mut rng).unwrap_or(&CHOICES[0]);
    let second = *CHOICES.choose(&mut rng).unwrap_or(&CHOICES[0]);
    let vote = json!({
        "identity": identity,
        "firstChoice": first,
        "secondChoice": second,
    });
    let accepted = if double_vote {
        let (a, b) = thread::scope(|s| {
            let a = s.spawn(|| client.post(url!(url, "api/vote")).json(&vote).send());
            let b = s.spawn(|| client.post(url!(url, "api/vote")).json(&vote).send());
            (a.join(), b.join())
        });
        let statuses = [
            a.map_err(|_| anyhow!("vote thread panicked"))??.status(),
            b.map_err(|_| anyhow!("vote thread panicked"))??.status(),
        ];
        let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        let forbidden = statuses
            .iter()
            .filter(|s| **s == StatusCode::FORBIDDEN)
            .count();
        if ok != 1 || forbidden != 1 {
            return Err(anyhow!(
                "duplicate vote for {identity} gave {statuses:?}, expected one OK and one FORBIDDEN"
            ));
        }
        true
    } else {
        client
            .post(url!(url, "api/vote"))
            .json(&vote)
            .send()
            .and_then(Response::error_for_status)
            .is_ok()
    };
    if !accepted {
        return Err(anyhow!("vote for {identity} was rejected"));
    }
    let post_vote = Instant::now();

    Ok((
        VoteTimings {
            register: post_register.duration_since(pre_register),
            payment: post_payment.duration_since(post_register),
            settle: post_settle.duration_since(post_payment),
            vote: post_vote.duration_since(post_settle),
        },
        first,
    ))
}

#[derive(Debug, Deserialize)]
struct ChoiceTotal {
    choice: String,
    total: u64,
}

/// Fetch the first-round totals.
fn results(url: &str) -> anyhow::Result<Vec<ChoiceTotal>> {
    Ok(Client::new()
        .get(url!(url, "api/results"))
        .send()
        .and_then(Response::error_for_status)?
        .json()?)
}

/// The total recorded for `choice`, or zero if it has none.
fn total_for(totals: &[ChoiceTotal], choice: &str) -> u64 {
    totals
        .iter()
        .find(|t| t.choice == choice)
        .map(|t| t.total)
        .unwrap_or(0)
}

/// Run the benchmark.
fn benchmark(url: &str, num_threads: usize, iterations: usize, double_vote: bool) -> anyhow::Result<()> {
    let end_val: usize = num_threads * iterations;
    let run: u32 = rand::random();
    let before = results(url)?;

    let start = Instant::now();
    let (durations, firsts) = thread::scope(|s| {
        let mut threads = Vec::with_capacity(num_threads);

        for start in (0..end_val).step_by(iterations) {
            let t = s.spawn(move || {
                let client = Client::new();
                let mut duration = VoteTimings::default();
                let mut firsts = Vec::with_capacity(iterations);

                for participant in start..(start + iterations) {
                    let id = identity(run, participant);
                    let (dur, first) = participate(url, &client, &id, double_vote)?;
                    duration += dur;
                    firsts.push(first);
                }

                Ok::<_, anyhow::Error>((duration / iterations as u32, firsts))
            });
            threads.push(t);
        }

        let mut duration = VoteTimings::default();
        let mut firsts = Vec::with_capacity(end_val);
        for t in threads {
            let (dur, f) = t.join().map_err(|_| anyhow!("thread panicked"))??;
            duration += dur;
            firsts.extend(f);
        }
        Ok::<_, anyhow::Error>((duration / num_threads as u32, firsts))
    })?;
    let total_duration = start.elapsed();

    let avg_total = durations.register + durations.payment + durations.settle + durations.vote;
    // Theoretical votes per sec is 1/avg_duration * num_threads.
    let votes_per_sec = num_threads as f64 / avg_total.as_secs_f64();
    // Actual votes per sec is total_votes / total_time.
    let actual_votes_per_sec = end_val as f64 / total_duration.as_secs_f64();

    println!("register: {:?}", durations.register);
    println!("payment:  {:?}", durations.payment);
    println!("settle:   {:?}", durations.settle);
    println!("vote:     {:?}", durations.vote);

    println!("\ntotal: {:?} ({:.2}/s)", avg_total, votes_per_sec);
    println!(
        "actual duration: {} votes in {:?} ({:.2}/s)",
        end_val, total_duration, actual_votes_per_sec
    );

    // Every recorded vote must show up in the tally, and nothing else.
    let after = results(url)?;
    for choice in CHOICES {
        let cast = firsts.iter().filter(|f| *f == choice).count() as u64;
        let gained = total_for(&after, choice).saturating_sub(total_for(&before, choice));
        if gained != cast {
            return Err(anyhow!(
                "tally for {choice} grew by {gained}, but {cast} votes were cast"
            ));
        }
    }
    println!("tally consistent with {} votes", firsts.len());

    Ok(())
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let url = args.remote.as_deref().unwrap_or(LOCAL_URL);

    // If we're not connecting remotely, bring up a local server.
    let mut proc: Option<Child> = None;
    if args.remote.is_none() {
        setup_deps(args.reuse_db)?;
        let logfile = match args.logfile {
            Some(path) => Stdio::from(File::create(path)?),
            None => {
                if args.quiet {
                    Stdio::null()
                } else {
                    Stdio::inherit()
                }
            }
        };
        proc = Some(launch_server(logfile)?);
    }

    // Use a closure to ensure the cleanup below runs.
    let result = (|| benchmark(url, args.threads, args.iterations, args.double_vote))();

    // Kill the server.
    if let Some(p) = proc.as_mut() {
        terminate_child(p)?;
        p.wait()?;
    }

    result
}

fn main() {
    if let Err(e) = run() {
        eprintln!("FATAL: {}", e);
        process::exit(1);
    }
}

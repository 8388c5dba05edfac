//! Readout server writing channel files while the live plotter follows them.

mod common;

use common::{request, test_settings, TestServer};
use sis3316_daq::decoder::{EventDecoder, Sis3316Decoder, Sis3316DecoderFactory};
use sis3316_daq::hardware::mock::MockDigitizer;
use sis3316_daq::live_plot::{run_display_loop, DisplayState, LivePlotSupervisor, PlotSink};
use sis3316_daq::messages::{Command, Frame, PlotterCommand, Reply, STARTED, STOPPED};
use sis3316_daq::transport::{serve, FrameClient};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const GUI: &str = "test-gui";

#[derive(Debug, Clone, Default)]
struct Rendered {
    path: Option<PathBuf>,
    adc_events: u64,
    time_events: u64,
    adc_bins: usize,
    edges: usize,
}

/// Keeps the last rendered state for inspection.
#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Rendered>>);

impl PlotSink for RecordingSink {
    fn render(&mut self, state: &DisplayState, adc_edges: &[f64]) {
        let mut last = self.0.lock().unwrap();
        *last = Rendered {
            path: state.path.clone(),
            adc_events: state.adc_counts.iter().sum(),
            time_events: state.time_counts.iter().sum(),
            adc_bins: state.adc_counts.len(),
            edges: adc_edges.len(),
        };
    }
}

impl RecordingSink {
    fn last(&self) -> Rendered {
        self.0.lock().unwrap().clone()
    }

    async fn wait_for<F>(&self, what: &str, mut done: F) -> Rendered
    where
        F: FnMut(&Rendered) -> bool,
    {
        for _ in 0..250 {
            let last = self.last();
            if done(&last) {
                return last;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}, last render {:?}", self.last());
    }
}

/// Plot control endpoint forwarding frames to the supervisor.
async fn spawn_plotter_endpoint(
    cancel: CancellationToken,
) -> (std::net::SocketAddr, mpsc::Receiver<PlotterCommand>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::channel::<Frame>(8);
    let (outbound, _) = broadcast::channel(8);
    tokio::spawn(serve(listener, frames_tx, outbound, cancel));

    let (control_tx, control_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if control_tx.send(PlotterCommand::from_frame(&frame)).await.is_err() {
                break;
            }
        }
    });
    (addr, control_rx)
}

#[tokio::test]
async fn test_plotter_follows_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("2026-10-18-1");
    let settings = test_settings();

    let server = TestServer::spawn(MockDigitizer::new().with_event_rate(4000.0), &settings).await;
    let mut gui = server.client().await;
    let mut statuses = Vec::new();

    let cancel = CancellationToken::new();
    let (plot_addr, control) = spawn_plotter_endpoint(cancel.clone()).await;
    let supervisor = LivePlotSupervisor::new(
        settings.live_plot.clone(),
        Arc::new(Sis3316DecoderFactory::default()),
    )
    .with_control(control);
    let sink = RecordingSink::default();
    let display = tokio::spawn(run_display_loop(supervisor, sink.clone(), cancel.clone()));

    // Files are announced before they exist; workers wait for them
    let ch0 = folder.join("ch00.dat");
    let ch3 = folder.join("ch03.dat");
    let mut plotter = FrameClient::connect(plot_addr, GUI).await.unwrap();
    plotter
        .send(PlotterCommand::Files(vec![ch0.clone(), ch3.clone()]).to_frame(GUI))
        .await
        .unwrap();

    let start = Command::Start {
        folder: folder.display().to_string(),
        channels: "[3, 0]".to_string(),
    };
    let reply = request(&mut gui, start.to_frame(GUI), &mut statuses).await;
    assert_eq!(reply, Reply::ok(STARTED));

    let rendered = sink
        .wait_for("ADC counts of ch00", |r| {
            r.path.as_deref() == Some(ch0.as_path()) && r.adc_events > 50
        })
        .await;
    assert_eq!(rendered.adc_bins, settings.live_plot.adc_bins);
    assert_eq!(rendered.edges, settings.live_plot.adc_bins + 1);

    sink.wait_for("event-rate counts", |r| r.time_events > 0).await;

    let reply = request(&mut gui, Command::Stop.to_frame(GUI), &mut statuses).await;
    assert_eq!(reply, Reply::ok(STOPPED));

    // Every written event is eventually shown
    let mut decoder = Sis3316Decoder::new(std::fs::File::open(&ch0).unwrap(), 0);
    let mut written = 0;
    while decoder.next_event().unwrap().is_some() {
        written += 1;
    }
    assert!(written > 50);
    sink.wait_for("the rest of ch00", |r| r.adc_events == written).await;

    plotter.send(PlotterCommand::Done.to_frame(GUI)).await.unwrap();

    cancel.cancel();
    display.await.unwrap().unwrap();
    server.close().await.unwrap();
}

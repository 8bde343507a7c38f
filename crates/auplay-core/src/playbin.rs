//! Local file pipeline
//!
//! [`LocalPlaybin`] plays `file://` URIs through a Symphonia decoder, a rubato
//! resampler and a cpal output stream. It reports its progress on the bus the
//! way a streaming media engine would: a state-changed message per transition,
//! tags and duration after pre-roll, async-done once pre-roll or a seek has
//! settled, and end-of-stream once the last sample has been played.
//!
//! Pre-roll (READY to PAUSED) opens the file and starts a stream worker
//! thread. The worker owns the cpal stream, decodes ahead of the device and
//! serves seek requests in order.

use std::path::PathBuf;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::mpsc::{ self, Receiver, RecvTimeoutError, Sender, TryRecvError };
use std::sync::Arc;
use std::thread::{ self, JoinHandle };
use std::time::Duration;

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use serde::{ Deserialize, Serialize };

use crate::decoder::{ Decoder, DecoderError };
use crate::output::{ self, AudioOutput, MixControls, SampleBuffer };
use crate::pipeline::{
    BalanceStage, Bus, BusMessage, ErrorDomain, MediaError, MessageSource, Pipeline, PipelineError,
    PipelineFactory, PipelineState, SeekRequest, StateChange,
};


/// Slowest supported playback rate.
pub const MIN_RATE: f64 = 0.25;

/// Fastest supported playback rate.
pub const MAX_RATE: f64 = 4.0;

const RESAMPLE_CHUNK: usize = 1024;
const SETTLE_TIMEOUT: Duration = Duration::from_secs( 5 );
const IDLE_WAIT: Duration = Duration::from_millis( 10 );
const FULL_WAIT: Duration = Duration::from_millis( 5 );

// Error codes, by domain
const CORE_NOT_IMPLEMENTED: i32 = 3;
const RESOURCE_FAILED: i32 = 1;
const RESOURCE_NOT_FOUND: i32 = 3;
const RESOURCE_OPEN_READ: i32 = 5;
const STREAM_FAILED: i32 = 1;
const STREAM_TYPE_NOT_FOUND: i32 = 4;
const STREAM_CODEC_NOT_FOUND: i32 = 6;
const STREAM_DECODE: i32 = 7;
const STREAM_DEMUX: i32 = 9;


/// Tuning for [`LocalPlaybin`].
#[derive( Debug, Clone, Copy, PartialEq, Serialize, Deserialize )]
pub struct PlaybinOptions {
    /// Insert the stereo balance stage when the device has two or more channels.
    pub balance: bool,
    /// How far ahead of the device to decode.
    pub buffer_ms: u32,
    /// Initial volume.
    pub volume: f64,
}


impl Default for PlaybinOptions {
    fn default() -> Self {
        Self { balance: true, buffer_ms: 50, volume: 1.0 }
    }
}


/// Builds a [`LocalPlaybin`] per player.
pub struct LocalPlaybinFactory {
    options: PlaybinOptions,
}


impl LocalPlaybinFactory {
    pub fn new( options: PlaybinOptions ) -> Self {
        Self { options }
    }
}


impl PipelineFactory for LocalPlaybinFactory {
    fn build( &self, bus: Bus ) -> Result<Box<dyn Pipeline>, PipelineError> {
        let device = output::default_device()
            .map_err( |e| PipelineError::ElementCreation( format!( "audio sink: {}", e ) ) )?;
        tracing::debug!( "Building playbin for {} ({} channels)", device.name, device.channels );
        Ok( Box::new( LocalPlaybin::new( bus, self.options, device.channels ) ) )
    }
}


/// Converts a `file://` URI to a path, decoding percent escapes.
pub fn uri_to_path( uri: &str ) -> Result<PathBuf, MediaError> {
    let Some( rest ) = uri.strip_prefix( "file://" ) else {
        let scheme = uri.split_once( "://" ).map( |( scheme, _ )| scheme ).unwrap_or( uri );
        return Err( MediaError::new(
            ErrorDomain::Core,
            CORE_NOT_IMPLEMENTED,
            format!( "No URI handler implemented for \"{}\".", scheme ),
        ));
    };
    // Drop an authority such as "localhost"
    let path = match rest.find( '/' ) {
        Some( 0 ) => rest,
        Some( start ) => &rest[ start.. ],
        None => rest,
    };

    urlencoding::decode( path )
        .map( |decoded| PathBuf::from( decoded.into_owned() ) )
        .map_err( |_| MediaError::new( ErrorDomain::Resource, RESOURCE_NOT_FOUND, "Invalid file URI." ) )
}


/// Classifies a decoder failure the way a media engine reports it.
pub fn media_error( error: &DecoderError ) -> MediaError {
    match error {
        DecoderError::FileOpen( e ) if e.kind() == std::io::ErrorKind::NotFound => {
            MediaError::new( ErrorDomain::Resource, RESOURCE_NOT_FOUND, "Resource not found." )
        }
        DecoderError::FileOpen( e ) => MediaError::new(
            ErrorDomain::Resource,
            RESOURCE_OPEN_READ,
            format!( "Could not open resource for reading: {}", e ),
        ),
        DecoderError::UnsupportedFormat => {
            MediaError::new( ErrorDomain::Stream, STREAM_TYPE_NOT_FOUND, "Could not determine type of stream." )
        }
        DecoderError::NoAudioTrack => {
            MediaError::new( ErrorDomain::Stream, STREAM_DEMUX, "No audio stream found." )
        }
        DecoderError::DecoderCreation( e ) => MediaError::new(
            ErrorDomain::Stream,
            STREAM_CODEC_NOT_FOUND,
            format!( "No decoder available: {}", e ),
        ),
        DecoderError::Decode( e ) => MediaError::new( ErrorDomain::Stream, STREAM_DECODE, e.clone() ),
        DecoderError::Seek( e ) => MediaError::new( ErrorDomain::Stream, STREAM_FAILED, e.clone() ),
    }
}


fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    let frames = channels.first().map_or( 0, Vec::len );
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


struct PanoramaStage {
    controls: Arc<MixControls>,
}


impl BalanceStage for PanoramaStage {
    fn set_panorama( &mut self, panorama: f32 ) {
        self.controls.set_balance( panorama );
    }
}


enum StreamCtrl {
    Seek { position: Duration, rate: f64 },
    Sync( Sender<()> ),
    Shutdown,
}


/// Pipeline playing local files.
pub struct LocalPlaybin {
    bus: Bus,
    options: PlaybinOptions,
    uri: String,
    state: PipelineState,
    controls: Arc<MixControls>,
    balance: Option<PanoramaStage>,
    stream: Option<StreamHandle>,
}


impl LocalPlaybin {
    pub fn new( bus: Bus, options: PlaybinOptions, device_channels: u16 ) -> Self {
        let controls = Arc::new( MixControls::new( options.volume.clamp( 0.0, 1.0 ) as f32 ) );
        let balance = ( options.balance && device_channels >= 2 )
            .then( || PanoramaStage { controls: Arc::clone( &controls ) } );
        if balance.is_none() {
            tracing::info!( "Balance stage unavailable ({} output channels)", device_channels );
        }

        Self {
            bus,
            options,
            uri: String::new(),
            state: PipelineState::Null,
            controls,
            balance,
            stream: None,
        }
    }


    /// Opens the source and starts streaming. Failures name the element at fault.
    fn preroll( &mut self ) -> Result<(), ( &'static str, MediaError )> {
        let path = uri_to_path( &self.uri ).map_err( |e| ( "source", e ) )?;
        let decoder = Decoder::open( &path ).map_err( |e| ( "decoder", media_error( &e ) ) )?;

        let stream = StreamHandle::start( decoder, self.bus.clone(), Arc::clone( &self.controls ), self.options )
            .map_err( |e| ( "audio-sink", MediaError::new( ErrorDomain::Resource, RESOURCE_FAILED, e ) ) )?;
        self.stream = Some( stream );
        Ok(())
    }


    /// Applies one step of a state change.
    fn enter( &mut self, next: PipelineState ) -> Result<(), ( &'static str, MediaError )> {
        match ( self.state, next ) {
            ( PipelineState::Null, PipelineState::Ready ) if self.uri.is_empty() => {
                tracing::debug!( "Playbin ready without a source" );
            }
            ( PipelineState::Ready, PipelineState::Paused ) => {
                self.controls.set_paused( true );
                self.preroll()?;
            }
            ( PipelineState::Paused, PipelineState::Playing ) => self.controls.set_paused( false ),
            ( PipelineState::Playing, PipelineState::Paused ) => self.controls.set_paused( true ),
            ( PipelineState::Paused, PipelineState::Ready ) => {
                self.controls.set_paused( true );
                self.stream = None;
            }
            _ => {}
        }
        Ok(())
    }


    /// Tags and the settled pre-roll, posted ahead of the READY to PAUSED
    /// state change so that no seek can be pending when they are handled.
    fn post_preroll_done( &self ) {
        let Some( stream ) = self.stream.as_ref() else {
            return;
        };
        if !stream.tags.is_empty() {
            self.bus.post( BusMessage::Tag { source: MessageSource::Element( "decoder".into() ), tags: stream.tags.clone() } );
        }
        self.bus.post( BusMessage::AsyncDone { source: MessageSource::Pipeline } );
    }
}


impl Pipeline for LocalPlaybin {
    fn set_uri( &mut self, uri: &str ) {
        self.uri = uri.to_string();
    }


    /// A failed pre-roll is reported once, as an error on the bus, and the
    /// transition is left pending at READY.
    fn set_state( &mut self, state: PipelineState ) -> Result<StateChange, PipelineError> {
        while self.state != state {
            let next = self.state.step_towards( state );
            if let Err( ( element, error ) ) = self.enter( next ) {
                tracing::warn!( "Playbin {}: {}", element, error.details() );
                self.bus.post( BusMessage::Error { source: MessageSource::Element( element.to_string() ), error } );
                return Ok( StateChange::Async );
            }

            let preroll = self.state == PipelineState::Ready && next == PipelineState::Paused;
            if preroll {
                self.post_preroll_done();
            }
            let old = std::mem::replace( &mut self.state, next );
            self.bus.post( BusMessage::StateChanged { source: MessageSource::Pipeline, old, new: next } );
            if preroll {
                self.bus.post( BusMessage::DurationChanged { source: MessageSource::Pipeline } );
            }
        }
        Ok( StateChange::Success )
    }


    fn current_state( &self ) -> PipelineState {
        self.state
    }


    fn wait_settled( &mut self ) -> Result<PipelineState, PipelineError> {
        if let Some( stream ) = self.stream.as_ref() {
            if !stream.sync() {
                return Err( PipelineError::StateChange( self.state ) );
            }
        }
        Ok( self.state )
    }


    fn query_position( &self ) -> Option<Duration> {
        self.stream.as_ref().map( StreamHandle::position )
    }


    fn query_duration( &self ) -> Option<Duration> {
        self.stream.as_ref().and_then( |s| s.duration )
    }


    fn send_seek( &mut self, seek: SeekRequest ) -> bool {
        let Some( stream ) = self.stream.as_ref() else {
            return false;
        };
        // Reverse playback needs a backwards-decoding source
        if seek.is_reverse() || !( MIN_RATE..=MAX_RATE ).contains( &seek.rate ) {
            tracing::warn!( "Playbin cannot play at rate {}", seek.rate );
            return false;
        }
        stream.send( StreamCtrl::Seek { position: seek.start, rate: seek.rate } )
    }


    fn set_volume( &mut self, volume: f64 ) {
        self.controls.set_volume( volume as f32 );
    }


    fn balance_stage( &mut self ) -> Option<&mut dyn BalanceStage> {
        self.balance.as_mut().map( |b| b as &mut dyn BalanceStage )
    }


    fn remove_balance_stage( &mut self ) {
        if let Some( stage ) = self.balance.take() {
            stage.controls.set_balance( 0.0 );
        }
    }


    fn detach_bus( &mut self ) {
        self.bus.detach();
    }
}


/// Control side of a running stream worker.
struct StreamHandle {
    tx: Sender<StreamCtrl>,
    thread: Option<JoinHandle<()>>,
    /// Source frames decoded so far.
    frames: Arc<AtomicU64>,
    sample_rate: u32,
    duration: Option<Duration>,
    tags: Vec<( String, String )>,
}


impl StreamHandle {
    fn start(
        mut decoder: Decoder,
        bus: Bus,
        controls: Arc<MixControls>,
        options: PlaybinOptions,
    ) -> Result<Self, String> {
        let sample_rate = decoder.sample_rate().max( 1 );
        let duration = decoder.duration();
        let tags = decoder.tags();
        let frames = Arc::new( AtomicU64::new( 0 ) );

        let ( tx, rx ) = mpsc::channel();
        let ( ready_tx, ready_rx ) = mpsc::channel::<Result<(), String>>();
        let worker_frames = Arc::clone( &frames );

        let thread = thread::Builder::new()
            .name( "playbin-stream".into() )
            .spawn( move || {
                let worker = match StreamWorker::new( decoder, bus, controls, worker_frames, options ) {
                    Ok( worker ) => worker,
                    Err( e ) => {
                        let _ = ready_tx.send( Err( e ) );
                        return;
                    }
                };
                let _ = ready_tx.send( Ok(()) );
                worker.run( rx );
            })
            .map_err( |e| e.to_string() )?;

        match ready_rx.recv() {
            Ok( Ok(()) ) => {}
            Ok( Err( e ) ) => {
                let _ = thread.join();
                return Err( e );
            }
            Err( _ ) => {
                let _ = thread.join();
                return Err( "stream worker exited during startup".into() );
            }
        }

        Ok( Self { tx, thread: Some( thread ), frames, sample_rate, duration, tags } )
    }


    fn send( &self, ctrl: StreamCtrl ) -> bool {
        self.tx.send( ctrl ).is_ok()
    }


    /// Waits until every request sent so far has been served.
    fn sync( &self ) -> bool {
        let ( reply_tx, reply_rx ) = mpsc::channel();
        self.send( StreamCtrl::Sync( reply_tx ) ) && reply_rx.recv_timeout( SETTLE_TIMEOUT ).is_ok()
    }


    fn position( &self ) -> Duration {
        let frames = self.frames.load( Ordering::Relaxed );
        Duration::from_secs_f64( frames as f64 / self.sample_rate as f64 )
    }
}


impl Drop for StreamHandle {
    fn drop( &mut self ) {
        let _ = self.tx.send( StreamCtrl::Shutdown );
        if let Some( thread ) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!( "Stream worker panicked" );
            }
        }
    }
}


#[derive( Debug, Clone, Copy, PartialEq, Eq )]
enum Phase {
    Decoding,
    /// Everything is decoded; waiting for the device to play it out.
    Draining,
    Ended,
}


/// Decoding side of a stream, running on its own thread.
struct StreamWorker {
    decoder: Decoder,
    bus: Bus,
    frames: Arc<AtomicU64>,
    // Dropping the output stops the device
    _output: AudioOutput,
    buffer: Arc<SampleBuffer>,
    resampler: FastFixedOut<f32>,
    /// Planar input not yet consumed by the resampler.
    pending: Vec<Vec<f32>>,
    /// Device rate over source rate.
    base_ratio: f64,
    /// Queued samples to keep ahead of the device.
    target_len: usize,
    phase: Phase,
}


impl StreamWorker {
    fn new(
        decoder: Decoder,
        bus: Bus,
        controls: Arc<MixControls>,
        frames: Arc<AtomicU64>,
        options: PlaybinOptions,
    ) -> Result<Self, String> {
        let channels = decoder.channels().max( 1 );
        let ( output, buffer ) = AudioOutput::new( channels as u16, 2.0, controls )
            .map_err( |e| e.to_string() )?;

        let base_ratio = output.sample_rate() as f64 / decoder.sample_rate().max( 1 ) as f64;
        if output.sample_rate() != decoder.sample_rate() {
            tracing::info!( "Resampling: {} Hz -> {} Hz", decoder.sample_rate(), output.sample_rate() );
        }

        // Created even at equal rates so the playback rate can change later
        let resampler = FastFixedOut::<f32>::new(
            base_ratio,
            MAX_RATE,
            PolynomialDegree::Cubic,
            RESAMPLE_CHUNK,
            channels,
        ).map_err( |e| format!( "Failed to create resampler: {}", e ) )?;

        output.play().map_err( |e| e.to_string() )?;

        let target_len = output.sample_rate() as usize * channels * options.buffer_ms.max( 10 ) as usize / 1000;

        Ok( Self {
            decoder,
            bus,
            frames,
            _output: output,
            buffer,
            resampler,
            pending: vec![ Vec::new(); channels ],
            base_ratio,
            target_len,
            phase: Phase::Decoding,
        })
    }


    fn run( mut self, rx: Receiver<StreamCtrl> ) {
        loop {
            let ctrl = match rx.try_recv() {
                Ok( ctrl ) => Some( ctrl ),
                Err( TryRecvError::Disconnected ) => break,
                Err( TryRecvError::Empty ) => match self.step() {
                    None => None,
                    Some( wait ) => match rx.recv_timeout( wait ) {
                        Ok( ctrl ) => Some( ctrl ),
                        Err( RecvTimeoutError::Timeout ) => None,
                        Err( RecvTimeoutError::Disconnected ) => break,
                    },
                },
            };

            if let Some( ctrl ) = ctrl {
                if !self.control( ctrl ) {
                    break;
                }
            }
        }
        tracing::debug!( "Stream worker exiting" );
    }


    /// Serves one request. False on shutdown.
    fn control( &mut self, ctrl: StreamCtrl ) -> bool {
        match ctrl {
            StreamCtrl::Seek { position, rate } => {
                self.seek( position, rate );
                true
            }
            StreamCtrl::Sync( reply ) => {
                let _ = reply.send(());
                true
            }
            StreamCtrl::Shutdown => false,
        }
    }


    fn seek( &mut self, position: Duration, rate: f64 ) {
        tracing::debug!( "Stream seek to {:?} at rate {}", position, rate );
        if let Err( e ) = self.decoder.seek( position ) {
            // Stays where it was; the seek still settles
            tracing::warn!( "Seek failed: {}", e );
        } else {
            let frames = ( position.as_secs_f64() * self.decoder.sample_rate() as f64 ) as u64;
            self.frames.store( frames, Ordering::Relaxed );
        }

        self.buffer.clear();
        for channel in self.pending.iter_mut() {
            channel.clear();
        }
        self.resampler.reset();
        if let Err( e ) = self.resampler.set_resample_ratio( self.base_ratio / rate, false ) {
            tracing::warn!( "Could not apply rate {}: {}", rate, e );
        }
        self.phase = Phase::Decoding;
        self.bus.post( BusMessage::AsyncDone { source: MessageSource::Pipeline } );
    }


    /// Does one unit of work. Returns how long to wait when there is nothing to do.
    fn step( &mut self ) -> Option<Duration> {
        match self.phase {
            Phase::Ended => Some( IDLE_WAIT ),
            Phase::Draining => {
                if !self.buffer.is_empty() {
                    return Some( IDLE_WAIT );
                }
                tracing::info!( "Stream reached end" );
                self.phase = Phase::Ended;
                self.bus.post( BusMessage::Eos { source: MessageSource::Pipeline } );
                None
            }
            Phase::Decoding => {
                if self.buffer.len() > self.target_len {
                    return Some( FULL_WAIT );
                }
                match self.decoder.decode_next() {
                    Ok( Some( samples ) ) => {
                        let channels = self.pending.len();
                        self.frames.fetch_add( ( samples.len() / channels ) as u64, Ordering::Relaxed );
                        self.feed( &samples );
                    }
                    Ok( None ) => {
                        self.flush();
                        self.phase = Phase::Draining;
                    }
                    Err( e ) => {
                        tracing::error!( "Decode error: {}", e );
                        self.bus.post( BusMessage::Error {
                            source: MessageSource::Element( "decoder".into() ),
                            error: media_error( &e ),
                        });
                        self.phase = Phase::Ended;
                    }
                }
                None
            }
        }
    }


    fn feed( &mut self, samples: &[f32] ) {
        let channels = self.pending.len();
        for frame in samples.chunks( channels ) {
            for ( ch, sample ) in frame.iter().enumerate() {
                self.pending[ ch ].push( *sample );
            }
        }

        while self.pending[ 0 ].len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let chunk: Vec<Vec<f32>> = self.pending
                .iter_mut()
                .map( |ch| ch.drain( ..needed ).collect() )
                .collect();

            match self.resampler.process( &chunk, None ) {
                Ok( resampled ) => self.enqueue( &interleave( &resampled ) ),
                Err( e ) => {
                    tracing::error!( "Resample error: {}", e );
                    break;
                }
            }
        }
    }


    fn flush( &mut self ) {
        if self.pending[ 0 ].is_empty() {
            return;
        }
        match self.resampler.process_partial( Some( self.pending.as_slice() ), None ) {
            Ok( resampled ) => self.enqueue( &interleave( &resampled ) ),
            Err( e ) => tracing::error!( "Final resample error: {}", e ),
        }
        for channel in self.pending.iter_mut() {
            channel.clear();
        }
    }


    fn enqueue( &self, samples: &[f32] ) {
        let pushed = self.buffer.push( samples );
        if pushed < samples.len() {
            tracing::warn!( "Output buffer full, dropped {} samples", samples.len() - pushed );
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::pipeline::LoopEvent;


    fn playbin( balance: bool, channels: u16 ) -> ( LocalPlaybin, Receiver<LoopEvent> ) {
        let ( tx, rx ) = mpsc::channel();
        let options = PlaybinOptions { balance, ..PlaybinOptions::default() };
        ( LocalPlaybin::new( Bus::new( tx ), options, channels ), rx )
    }


    fn drain( rx: &Receiver<LoopEvent> ) -> Vec<BusMessage> {
        rx.try_iter()
            .filter_map( |e| match e {
                LoopEvent::Message( m ) => Some( m ),
                LoopEvent::Quit => None,
            })
            .collect()
    }


    #[test]
    fn test_uri_to_path() {
        assert_eq!( uri_to_path( "file:///tmp/a.mp3" ).unwrap(), PathBuf::from( "/tmp/a.mp3" ) );
        assert_eq!( uri_to_path( "file:///tmp/my%20song.mp3" ).unwrap(), PathBuf::from( "/tmp/my song.mp3" ) );
        assert_eq!( uri_to_path( "file://localhost/tmp/a.mp3" ).unwrap(), PathBuf::from( "/tmp/a.mp3" ) );
        assert_eq!( uri_to_path( "file:///tmp/100%" ).unwrap(), PathBuf::from( "/tmp/100%" ) );
        assert_eq!( uri_to_path( "file:///tmp/%E2%99%AB.flac" ).unwrap(), PathBuf::from( "/tmp/\u{266B}.flac" ) );
        assert!( uri_to_path( "file:///tmp/%FF.mp3" ).is_err() );
    }


    #[test]
    fn test_remote_uri_unsupported() {
        let error = uri_to_path( "https://example.com/a.mp3" ).unwrap_err();
        assert_eq!( error.domain, ErrorDomain::Core );
        assert!( error.message.contains( "https" ) );
    }


    #[test]
    fn test_media_error_classification() {
        let missing = DecoderError::FileOpen( std::io::Error::from( std::io::ErrorKind::NotFound ) );
        assert_eq!( media_error( &missing ).domain, ErrorDomain::Resource );
        assert_eq!( media_error( &missing ).code, RESOURCE_NOT_FOUND );
        assert_eq!( media_error( &DecoderError::UnsupportedFormat ).domain, ErrorDomain::Stream );
        assert_eq!( media_error( &DecoderError::Decode( "bad".into() ) ).code, STREAM_DECODE );
    }


    #[test]
    fn test_ready_without_device_access() {
        let ( mut playbin, rx ) = playbin( true, 2 );
        playbin.set_uri( "file:///tmp/a.mp3" );
        assert_eq!( playbin.set_state( PipelineState::Ready ).unwrap(), StateChange::Success );

        assert_eq!(
            drain( &rx ),
            vec![ BusMessage::StateChanged {
                source: MessageSource::Pipeline,
                old: PipelineState::Null,
                new: PipelineState::Ready,
            }]
        );
        assert_eq!( playbin.query_position(), None );
        assert!( !playbin.send_seek( SeekRequest::new( 1000, 1.0 ) ) );
    }


    #[test]
    fn test_preroll_missing_file_fails() {
        let ( mut playbin, rx ) = playbin( true, 2 );
        playbin.set_uri( "file:///nonexistent/auplay/missing.mp3" );
        playbin.set_state( PipelineState::Ready ).unwrap();
        drain( &rx );

        assert_eq!( playbin.set_state( PipelineState::Paused ).unwrap(), StateChange::Async );
        assert_eq!( playbin.current_state(), PipelineState::Ready );

        let messages = drain( &rx );
        assert_eq!( messages.len(), 1 );
        match &messages[ 0 ] {
            BusMessage::Error { source, error } => {
                assert_eq!( *source, MessageSource::Element( "decoder".into() ) );
                assert_eq!( error.domain, ErrorDomain::Resource );
                assert_eq!( error.code, RESOURCE_NOT_FOUND );
            }
            other => panic!( "unexpected message {:?}", other ),
        }
    }


    #[test]
    fn test_missing_file_reports_one_error() {
        use std::sync::Mutex;
        use crate::event::PlayerEvent;
        use crate::player::AudioPlayer;
        use crate::testing::{ wait_until, RecordingSink };

        let buses = Arc::new( Mutex::new( Vec::new() ) );
        let factory = {
            let buses = Arc::clone( &buses );
            move |bus: Bus| -> Result<Box<dyn Pipeline>, PipelineError> {
                buses.lock().unwrap().push( bus.clone() );
                Ok( Box::new( LocalPlaybin::new( bus, PlaybinOptions::default(), 2 ) ) )
            }
        };
        let sink = RecordingSink::new();
        let player = AudioPlayer::new( "p1", Arc::new( factory ), sink.clone() ).unwrap();

        player.set_source_url( "file:///nonexistent/auplay/missing.mp3", true ).unwrap();
        assert!( sink.wait_for( PlayerEvent::is_error ) );

        // Everything posted before the marker has been handled once it lands
        let bus = buses.lock().unwrap()[ 0 ].clone();
        bus.post( BusMessage::Buffering { source: MessageSource::Pipeline, percent: 9 } );
        assert!( wait_until( || player.status().buffering_percent == 9 ) );

        assert_eq!( sink.count( PlayerEvent::is_error ), 1 );
        assert!( !player.status().is_initialized );
        player.dispose().unwrap();
    }


    #[test]
    fn test_balance_stage_needs_stereo() {
        let ( mut mono, _rx ) = playbin( true, 1 );
        assert!( mono.balance_stage().is_none() );

        let ( mut disabled, _rx ) = playbin( false, 2 );
        assert!( disabled.balance_stage().is_none() );

        let ( mut stereo, _rx ) = playbin( true, 2 );
        stereo.balance_stage().unwrap().set_panorama( -0.5 );
        assert_eq!( stereo.controls.balance(), -0.5 );
        stereo.remove_balance_stage();
        assert!( stereo.balance_stage().is_none() );
        assert_eq!( stereo.controls.balance(), 0.0 );
    }


    #[test]
    fn test_detached_bus_posts_nothing() {
        let ( mut playbin, rx ) = playbin( true, 2 );
        playbin.detach_bus();
        playbin.set_state( PipelineState::Ready ).unwrap();
        assert!( drain( &rx ).is_empty() );
    }


    #[test]
    fn test_interleave() {
        assert_eq!( interleave( &[ vec![ 1.0, 2.0 ], vec![ 3.0, 4.0 ] ] ), vec![ 1.0, 3.0, 2.0, 4.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }
}

//! Dedicated thread servicing one player's bus.
//!
//! The pipeline is built on this thread so that its bus is bound to the
//! thread's queue. Construction blocks the caller until the pipeline exists;
//! message delivery starts once a handler is attached.

use std::sync::mpsc::{ self, Receiver, Sender };
use std::sync::Arc;
use std::thread::{ self, JoinHandle };

use crate::pipeline::{ Bus, BusMessage, LoopEvent, Pipeline, PipelineError, PipelineFactory };


type MessageHandler = Box<dyn FnMut( BusMessage ) + Send>;


/// Owned worker running a player's message loop.
pub struct PlayerThread {
    name: String,
    tx: Sender<LoopEvent>,
    attach_tx: Option<Sender<MessageHandler>>,
    handle: Option<JoinHandle<()>>,
}


impl PlayerThread {
    /// Starts the thread and builds the pipeline on it.
    ///
    /// Returns once the pipeline exists. A construction failure stops the
    /// thread and is returned to the caller.
    pub fn spawn(
        name: &str,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<( Self, Box<dyn Pipeline> ), PipelineError> {
        let ( tx, rx ) = mpsc::channel::<LoopEvent>();
        let ( ready_tx, ready_rx ) = mpsc::channel::<Result<Box<dyn Pipeline>, PipelineError>>();
        let ( attach_tx, attach_rx ) = mpsc::channel::<MessageHandler>();
        let bus = Bus::new( tx.clone() );

        let handle = thread::Builder::new()
            .name( format!( "player-{}", name ) )
            .spawn( move || {
                let built = factory.build( bus );
                let failed = built.is_err();
                if ready_tx.send( built ).is_err() || failed {
                    return;
                }
                // Messages posted meanwhile stay queued until a handler is attached
                let Ok( handler ) = attach_rx.recv() else {
                    return;
                };
                run_loop( rx, handler );
            })
            .map_err( |e| PipelineError::Thread( e.to_string() ) )?;

        let pipeline = match ready_rx.recv() {
            Ok( Ok( pipeline ) ) => pipeline,
            Ok( Err( e ) ) => {
                let _ = handle.join();
                return Err( e );
            }
            Err( _ ) => {
                let _ = handle.join();
                return Err( PipelineError::Thread( "exited while building the pipeline".into() ) );
            }
        };

        tracing::debug!( "Player thread {} started", name );

        Ok((
            Self {
                name: name.to_string(),
                tx,
                attach_tx: Some( attach_tx ),
                handle: Some( handle ),
            },
            pipeline,
        ))
    }


    /// Installs the message handler and starts delivery. Only the first call has effect.
    pub fn attach<F>( &mut self, handler: F )
    where
        F: FnMut( BusMessage ) + Send + 'static,
    {
        if let Some( attach_tx ) = self.attach_tx.take() {
            if attach_tx.send( Box::new( handler ) ).is_err() {
                tracing::warn!( "Player thread {} is gone, handler not attached", self.name );
            }
        }
    }


    pub fn is_running( &self ) -> bool {
        self.handle.is_some()
    }


    /// Quits the loop and joins the thread.
    ///
    /// When called from the player thread itself the join is skipped; the loop
    /// still exits after the current message.
    pub fn stop( &mut self ) {
        let Some( handle ) = self.handle.take() else {
            return;
        };

        // Unblocks a thread still waiting for its handler
        self.attach_tx = None;
        let _ = self.tx.send( LoopEvent::Quit );

        if handle.thread().id() == thread::current().id() {
            tracing::debug!( "Player thread {} stopping itself, not joining", self.name );
            return;
        }
        if handle.join().is_err() {
            tracing::error!( "Player thread {} panicked", self.name );
        }
        tracing::debug!( "Player thread {} stopped", self.name );
    }
}


impl Drop for PlayerThread {
    fn drop( &mut self ) {
        self.stop();
    }
}


fn run_loop( rx: Receiver<LoopEvent>, mut handler: MessageHandler ) {
    while let Ok( event ) = rx.recv() {
        match event {
            LoopEvent::Message( message ) => handler( message ),
            LoopEvent::Quit => break,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::pipeline::{ MessageSource, PipelineState };
    use crate::testing::{ wait_until, MockFactory };


    #[test]
    fn test_construction_failure_is_returned() {
        let result = PlayerThread::spawn( "p1", MockFactory::failing() );
        assert!( matches!( result, Err( PipelineError::ElementCreation( _ ) ) ) );
    }


    #[test]
    fn test_messages_delivered_in_order() {
        let factory = MockFactory::new();
        let ( mut thread, mut pipeline ) = PlayerThread::spawn( "p1", factory.clone() ).unwrap();

        // Posted before the handler exists
        pipeline.set_state( PipelineState::Paused ).unwrap();

        let seen = Arc::new( Mutex::new( Vec::new() ) );
        let seen_clone = Arc::clone( &seen );
        thread.attach( move |message| seen_clone.lock().unwrap().push( message ) );

        factory.last().post_eos();
        assert!( wait_until( || seen.lock().unwrap().len() == 3 ) );

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                BusMessage::StateChanged {
                    source: MessageSource::Pipeline,
                    old: PipelineState::Null,
                    new: PipelineState::Ready,
                },
                BusMessage::StateChanged {
                    source: MessageSource::Pipeline,
                    old: PipelineState::Ready,
                    new: PipelineState::Paused,
                },
                BusMessage::Eos { source: MessageSource::Pipeline },
            ]
        );

        thread.stop();
        assert!( !thread.is_running() );
    }


    #[test]
    fn test_stop_without_handler() {
        let ( mut thread, _pipeline ) = PlayerThread::spawn( "p1", MockFactory::new() ).unwrap();
        thread.stop();
        thread.stop();
        assert!( !thread.is_running() );
    }
}

//! Command-line argument parsing for auplay.

use std::path::PathBuf;

use clap::Parser;


/// Auplay - drive audio players with JSON method calls, or play files.
#[derive( Parser, Debug )]
#[command( name = "auplay" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Read method calls from this file instead of stdin.
    #[arg( short, long )]
    pub script: Option<PathBuf>,

    /// Settings file to use instead of the one in the config directory.
    #[arg( long )]
    pub settings: Option<PathBuf>,

    /// Do not insert the balance stage.
    #[arg( long )]
    pub no_balance: bool,

    /// Save the effective settings before running.
    #[arg( long )]
    pub write_settings: bool,

    /// Local files to play in sequence.
    #[arg( trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_files() {
        let args = Args::parse_from([ "auplay", "--no-balance", "a.mp3", "b.flac" ]);
        assert!( args.no_balance );
        assert_eq!( args.files, vec![ PathBuf::from( "a.mp3" ), PathBuf::from( "b.flac" ) ] );
        assert!( args.script.is_none() );
    }


    #[test]
    fn test_parse_script() {
        let args = Args::parse_from([ "auplay", "--script", "calls.jsonl" ]);
        assert_eq!( args.script, Some( PathBuf::from( "calls.jsonl" ) ) );
        assert!( args.files.is_empty() );
    }
}

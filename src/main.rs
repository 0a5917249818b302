fn main() {
    if handle_cli_flags() {
        return;
    }

    topic_gallery::logging::init();
    let command = match topic_gallery::app::Command::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {err}\n\n{HELP}");
            std::process::exit(2);
        }
    };
    if let Err(err) = topic_gallery::run(command) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

const HELP: &str = "Topic Gallery: image previews for discussion-board topic listings.

  --scan <LISTING_URL>     Annotate a listing and print one line per topic
  --gallery <TOPIC_URL>    Print the full-resolution images of a topic
  --download               With --gallery, save every image
  --version, -V            Show version and exit
  --help,    -h            Show this help message";

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("Topic Gallery {}", topic_gallery::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{HELP}");
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
